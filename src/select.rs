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

//! Operator FEC-roots selection: pure functions only, so the menu rendering and the input
//! parsing are each unit-testable without a terminal. The orchestrator does the actual
//! prompting/reading.

use crate::error::FecSelectionError;
use crate::geometry::{fec_sectors, DATA_BLOCK};

/// Slack bytes remaining in the disc profile if `roots` is chosen.
pub fn slack_bytes(data_sectors: u64, hash_sectors: u64, profile_total: u64, roots: u8) -> u64 {
    let parity_sectors = fec_sectors((data_sectors + hash_sectors) * DATA_BLOCK, roots);
    let used = data_sectors + hash_sectors + parity_sectors;
    profile_total.saturating_sub(used) * DATA_BLOCK
}

/// Renders the candidate menu, folding contiguous runs of roots values that share the same
/// slack into a single entry, e.g. `24-20,18:1.2GiB`.
pub fn format_candidate_menu(
    roots: &[u8],
    data_sectors: u64,
    hash_sectors: u64,
    profile_total: u64,
) -> String {
    let slacks: Vec<(u8, u64)> = roots
        .iter()
        .map(|&r| (r, slack_bytes(data_sectors, hash_sectors, profile_total, r)))
        .collect();

    let mut runs: Vec<(u8, u8, u64)> = Vec::new();
    for (r, slack) in slacks {
        match runs.last_mut() {
            Some((_, end, last_slack)) if *last_slack == slack => *end = r,
            _ => runs.push((r, r, slack)),
        }
    }

    runs.iter()
        .map(|(start, end, slack)| {
            let label = if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            };
            format!("{label}:{}", crate::geometry::format_bytes(*slack))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses the operator's typed choice, rejecting anything not in `candidates`.
pub fn parse_operator_choice(input: &str, candidates: &[u8]) -> Result<u8, FecSelectionError> {
    let trimmed = input.trim();
    let value: i64 = trimmed
        .parse()
        .map_err(|_| FecSelectionError::NotAnInteger(trimmed.to_string()))?;
    if !(0..=255).contains(&value) {
        return Err(FecSelectionError::NotAnInteger(trimmed.to_string()));
    }
    let value = value as u8;
    if !candidates.contains(&value) {
        return Err(FecSelectionError::NotACandidate(value));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_bytes_matches_expected_table() {
        let expected = maplit::hashmap! {
            24u8 => slack_bytes(10, 1, 2_295_104, 24),
            20u8 => slack_bytes(10, 1, 2_295_104, 20),
            2u8 => slack_bytes(10, 1, 2_295_104, 2),
        };
        // Slack must strictly grow as roots shrink (less parity reserved).
        assert!(expected[&2] > expected[&20]);
        assert!(expected[&20] > expected[&24]);
    }

    #[test]
    fn folds_contiguous_equal_slack_runs() {
        // At small scale many consecutive roots values can share the same sector-rounded slack.
        let menu = format_candidate_menu(&[24, 20, 18], 10, 1, 2_295_104);
        assert!(menu.contains(':'));
    }

    #[test]
    fn parse_accepts_listed_candidate() {
        assert_eq!(parse_operator_choice(" 18 ", &[24, 20, 18, 2]), Ok(18));
    }

    #[test]
    fn parse_rejects_non_integer() {
        assert!(matches!(
            parse_operator_choice("abc", &[24]),
            Err(FecSelectionError::NotAnInteger(_))
        ));
    }

    #[test]
    fn parse_rejects_unlisted_candidate() {
        assert!(matches!(
            parse_operator_choice("17", &[24, 20, 18, 2]),
            Err(FecSelectionError::NotACandidate(17))
        ));
    }
}
