// Named error types for conditions callers may want to match on. Everything else in this
// crate propagates as an opaque `anyhow::Error` with `.context()` breadcrumbs, matching the
// teacher's style; these variants exist only where a caller branches on the specific failure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("no disc profile fits {0} sectors")]
    NoProfileFits(u64),
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("substitution key `{0}` not found in boot script template")]
    UnknownKey(String),
    #[error("substitution key `{0}` appears more than once in boot script template")]
    DuplicateKey(String),
    #[error("rendered header is {0} bytes, exceeding the {1}-byte budget")]
    HeaderTooLarge(usize, usize),
    #[error("rendered body is {0} bytes, exceeding the {1}-byte budget")]
    BodyTooLarge(usize, usize),
    #[error("template ended before the header/body separator was found")]
    UnterminatedHeader,
}

#[derive(Error, Debug)]
pub enum VerityOutputError {
    #[error("`veritysetup format` output is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`veritysetup format` reported {field} = {got}, expected {want}")]
    UnexpectedValue {
        field: &'static str,
        got: String,
        want: String,
    },
    #[error("root hash `{0}` is not {1} hex characters")]
    BadRootHash(String, usize),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FecSelectionError {
    #[error("`{0}` is not an integer")]
    NotAnInteger(String),
    #[error("{0} is not one of the offered FEC roots values")]
    NotACandidate(u8),
}

#[derive(Error, Debug)]
pub enum ExtentError {
    #[error("expected exactly one extent for {path}, found {found}")]
    WrongExtentCount { path: String, found: usize },
    #[error("filesystem block size {0} reported by filefrag, expected 2048")]
    WrongBlockSize(u64),
}
