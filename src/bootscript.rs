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

//! Boot Script Templater (C2). Renders `assets/boot.sh`, a two-part shell template, into a
//! header blob (<=218 bytes, written at image offset 0) and a body blob (<=32256 bytes,
//! written at offset 512). The template grammar has two sentinel line kinds:
//!
//! - `: <<-TOKEN` opens a substitution block: every following line up to a line exactly equal
//!   to `TOKEN` has the form `KEY=...` and is rewritten to `KEY=<shell-quoted value>`, drawn
//!   from the caller's substitution map. The `TOKEN` line itself is dropped.
//! - `: <<_TOKEN` marks the header/body boundary: this line is the last line of the header.
//!   The body is then scanned for a line exactly equal to `TOKEN`; when found, every
//!   substitution key not yet consumed by the header is emitted there as a trailing
//!   `KEY=<value>` assignment, in the order it was inserted into the map, before the rest of
//!   the body continues verbatim.

use crate::error::TemplateError;

pub const HEADER_BUDGET: usize = 218;
pub const BODY_BUDGET: usize = 0x8000 - 512; // 32256

const HEREDOC_PREFIX: &str = ": <<-";
const SEPARATOR_PREFIX: &str = ": <<_";

pub const BOOT_TEMPLATE: &str = include_str!("../assets/boot.sh");

pub struct BootScript {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

/// An insertion-ordered key/value request. `None` values render as an empty quoted string.
#[derive(Default)]
pub struct SubstitutionMap(Vec<(String, Option<String>)>);

impl SubstitutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) {
        self.0.push((key.into(), value.map(Into::into)));
    }

    fn take(&mut self, key: &str) -> Option<Option<String>> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    fn drain_remaining(&mut self) -> Vec<(String, Option<String>)> {
        std::mem::take(&mut self.0)
    }
}

/// Shell-quotes `value` as a single-quoted literal, or `''` for `None`. `'` is escaped by
/// closing the quote, emitting an escaped quote, and reopening it (`'\''`).
pub fn shell_quote(value: Option<&str>) -> String {
    match value {
        None => "''".to_string(),
        Some(v) => {
            let mut out = String::with_capacity(v.len() + 2);
            out.push('\'');
            for c in v.chars() {
                if c == '\'' {
                    out.push_str("'\\''");
                } else {
                    out.push(c);
                }
            }
            out.push('\'');
            out
        }
    }
}

pub fn render(
    template: &str,
    mut subs: SubstitutionMap,
) -> Result<BootScript, TemplateError> {
    let mut lines = template.lines();
    let mut header = String::new();
    let mut body_token: Option<String> = None;

    while let Some(line) = lines.next() {
        if let Some(token) = line.strip_prefix(HEREDOC_PREFIX) {
            let token = token.trim().to_string();
            loop {
                let entry_line = lines
                    .next()
                    .ok_or(TemplateError::UnterminatedHeader)?;
                if entry_line == token {
                    break;
                }
                let key = entry_line
                    .split('=')
                    .next()
                    .unwrap_or(entry_line)
                    .trim()
                    .to_string();
                let value = subs
                    .take(&key)
                    .ok_or_else(|| TemplateError::UnknownKey(key.clone()))?;
                header.push_str(&key);
                header.push('=');
                header.push_str(&shell_quote(value.as_deref()));
                header.push('\n');
            }
        } else if line.starts_with(SEPARATOR_PREFIX) {
            // Keep the leading `_`: the heredoc delimiter for `: <<_TOKEN` is `_TOKEN`, not
            // `TOKEN` (mirrors bootsh.py's `s[len(self._SEP_DOC) - 1:]` slice).
            let token = line[SEPARATOR_PREFIX.len() - 1..].trim().to_string();
            header.push_str(line);
            header.push('\n');
            body_token = Some(token);
            break;
        } else {
            header.push_str(line);
            header.push('\n');
        }
    }

    let body_token = body_token.ok_or(TemplateError::UnterminatedHeader)?;
    let mut body = String::new();
    let mut found = false;
    for line in lines.by_ref() {
        if line == body_token {
            found = true;
            body.push('\n');
            body.push_str(line);
            body.push('\n');
            for (key, value) in subs.drain_remaining() {
                body.push_str(&key);
                body.push('=');
                body.push_str(&shell_quote(value.as_deref()));
                body.push('\n');
            }
            break;
        }
        body.push_str(line);
        body.push('\n');
    }
    if !found {
        if let Some((key, _)) = subs.0.first() {
            return Err(TemplateError::UnknownKey(key.clone()));
        }
    }
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }

    let header_bytes = header.into_bytes();
    let body_bytes = body.into_bytes();
    if header_bytes.len() > HEADER_BUDGET {
        return Err(TemplateError::HeaderTooLarge(
            header_bytes.len(),
            HEADER_BUDGET,
        ));
    }
    if body_bytes.len() > BODY_BUDGET {
        return Err(TemplateError::BodyTooLarge(body_bytes.len(), BODY_BUDGET));
    }
    Ok(BootScript {
        header: header_bytes,
        body: body_bytes,
    })
}

/// Builds the substitution map for a single pipeline run (spec.md §4.7 step 6).
#[allow(clippy::too_many_arguments)]
pub fn build_substitutions(
    iso_sz: u64,
    hash_sz: u64,
    dmid: &str,
    offset: Option<u64>,
    length: Option<u64>,
    cipher: Option<&str>,
    pass: Option<&str>,
    disc_id: Option<&str>,
    hint: Option<&str>,
) -> SubstitutionMap {
    let mut subs = SubstitutionMap::new();
    subs.insert("ISO_SZ", Some(iso_sz.to_string()));
    subs.insert("HASH_SZ", Some(hash_sz.to_string()));
    subs.insert("DMID", Some(dmid.to_string()));
    subs.insert("OFFSET", offset.map(|v| v.to_string()));
    subs.insert("LENGTH", length.map(|v| v.to_string()));
    subs.insert("CIPHER", cipher.map(|v| v.to_string()));
    subs.insert("_PASS", pass.map(|v| v.to_string()));
    subs.insert("_DISC_ID", disc_id.map(|v| v.to_string()));
    subs.insert("_HINT", hint.map(|v| v.to_string()));
    subs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_subs() -> SubstitutionMap {
        build_substitutions(
            1_064_960,
            12_288,
            "mylabel",
            Some(2048),
            Some(4096),
            Some("aes-xts-plain64"),
            Some("s3cr3t"),
            None,
            Some("ask mom"),
        )
    }

    #[test]
    fn renders_within_budget() {
        let script = render(BOOT_TEMPLATE, sample_subs()).unwrap();
        assert!(script.header.len() <= HEADER_BUDGET);
        assert!(script.body.len() <= BODY_BUDGET);
        let header_str = String::from_utf8(script.header).unwrap();
        assert!(header_str.contains("DMID='mylabel'"));
        let body_str = String::from_utf8(script.body).unwrap();
        assert!(body_str.contains("_PASS='s3cr3t'"));
        assert!(body_str.contains("_DISC_ID=''"));
    }

    #[test]
    fn rejects_unknown_template_key() {
        // build_substitutions always supplies every key the template references; remove one to
        // simulate a caller omission.
        let mut subs = sample_subs();
        subs.take("DMID");
        assert!(matches!(
            render(BOOT_TEMPLATE, subs),
            Err(TemplateError::UnknownKey(k)) if k == "DMID"
        ));
    }

    #[test]
    fn rejects_header_over_budget() {
        let mut subs = sample_subs();
        subs.take("DMID");
        subs.insert("DMID", Some("x".repeat(1000)));
        assert!(matches!(
            render(BOOT_TEMPLATE, subs),
            Err(TemplateError::HeaderTooLarge(_, HEADER_BUDGET))
        ));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote(Some("it's")), "'it'\\''s'");
        assert_eq!(shell_quote(None), "''");
    }
}
