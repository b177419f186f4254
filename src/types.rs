// Copyright 2026 Wormcast maintainers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Small validated string newtypes shared across the pipeline: a volume/device-mapper
//! identifier, a disc media identifier, and a free-form password hint.

use anyhow::{bail, Result};

const VOLID_MAX_LEN: usize = 15;

/// A stripped ASCII identifier of at most 15 characters. Projected uppercase for use as the
/// ISO-9660 volume label, and lowercase for use as the device-mapper name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolId(String);

impl VolId {
    pub fn parse(raw: &str) -> Result<Self> {
        let stripped = raw.trim();
        if stripped.is_empty() {
            bail!("volume id must not be empty");
        }
        if stripped.len() > VOLID_MAX_LEN {
            bail!(
                "volume id `{}` is {} characters, exceeding the {}-character limit",
                stripped,
                stripped.len(),
                VOLID_MAX_LEN
            );
        }
        if !stripped.is_ascii() {
            bail!("volume id `{}` must be ASCII", stripped);
        }
        if !stripped
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!(
                "volume id `{}` must contain only letters, digits, `_`, and `-`",
                stripped
            );
        }
        Ok(Self(stripped.to_string()))
    }

    /// Projection used as the ISO-9660/Joliet volume label.
    pub fn volume_label(&self) -> String {
        self.0.to_uppercase()
    }

    /// Projection used as the device-mapper name (`<dmid>_crypt`, `<dmid>.sqfs`, ...).
    pub fn dmid(&self) -> String {
        self.0.to_lowercase()
    }
}

impl std::fmt::Display for VolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A small fixed allow-list of disc media identifiers. spec.md names one example
/// (`"VERBAT/IMk/0"`) without enumerating the rest; see DESIGN.md for the Open Question
/// resolution that settled on this concrete set.
const DISC_ID_ALLOWLIST: &[&str] = &[
    "VERBAT/IMk/0",
    "VERBAT/IMe/0",
    "CMC/MAG/0",
    "RITEK/F1/0",
    "TYYT02/0",
    "MKM/001/0",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscId(String);

impl DiscId {
    pub fn parse(raw: &str) -> Result<Self> {
        let stripped = raw.trim();
        if !DISC_ID_ALLOWLIST.contains(&stripped) {
            bail!(
                "disc id `{}` is not in the supported list ({})",
                stripped,
                DISC_ID_ALLOWLIST.join(", ")
            );
        }
        Ok(Self(stripped.to_string()))
    }
}

impl std::fmt::Display for DiscId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A free-form ASCII string that must survive being embedded as a shell-quoted literal in the
/// boot script. We require printable ASCII (no control characters) so the quoting step
/// (`crate::bootscript::shell_quote`) always produces a well-formed single-quoted literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassHint(String);

impl PassHint {
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            bail!("password hint must be printable ASCII with no control characters");
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PassHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volid_projections() {
        let v = VolId::parse("  MyLabel ").unwrap();
        assert_eq!(v.volume_label(), "MYLABEL");
        assert_eq!(v.dmid(), "mylabel");
    }

    #[test]
    fn volid_rejects_too_long() {
        assert_eq!("THISISSIXTEENXXX".len(), 16);
        assert!(VolId::parse("THISISSIXTEENXXX").is_err());
        assert!(VolId::parse("FIFTEENCHARSOK!").is_err()); // '!' not allowed
        assert!(VolId::parse("FIFTEENCHARSOK").is_ok());
    }

    #[test]
    fn volid_rejects_non_ascii_and_punctuation() {
        assert!(VolId::parse("caf\u{e9}").is_err());
        assert!(VolId::parse("has space").is_err());
    }

    #[test]
    fn discid_allowlist() {
        assert!(DiscId::parse("VERBAT/IMk/0").is_ok());
        assert!(DiscId::parse("NOT/A/REAL/ID").is_err());
    }

    #[test]
    fn passhint_rejects_control_chars() {
        assert!(PassHint::parse("a normal hint").is_ok());
        assert!(PassHint::parse("bad\nhint").is_err());
    }
}
