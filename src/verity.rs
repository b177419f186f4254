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

//! Verity Runner (C4): runs `veritysetup format` concurrently at every candidate FEC-roots
//! value, gated by a semaphore sized to the CPU count, and folds the results into a single
//! root hash plus a menu the operator picks a roots value from.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::error::VerityOutputError;
use crate::geometry::{fec_bytes, DATA_BLOCK, HASH_SIZE, MAX_FEC_ROOTS, MIN_FEC_ROOTS};

/// An insertion-ordered `key -> value` mapping parsed from `veritysetup format` stdout, e.g.
/// `Root hash:      <hex>`. Keys are everything before the first `:`, trimmed; values are
/// everything after, trimmed.
#[derive(Debug, Default)]
pub struct VerityOutput(Vec<(String, String)>);

impl VerityOutput {
    pub fn parse(stdout: &str) -> Self {
        let mut entries = Vec::new();
        for line in stdout.lines() {
            if let Some((k, v)) = line.split_once(':') {
                entries.push((k.trim().to_string(), v.trim().to_string()));
            }
        }
        Self(entries)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &'static str) -> Result<&str, VerityOutputError> {
        self.get(key).ok_or(VerityOutputError::MissingField(key))
    }

    fn require_eq(&self, key: &'static str, want: &str) -> Result<(), VerityOutputError> {
        let got = self.require(key)?;
        if got != want {
            return Err(VerityOutputError::UnexpectedValue {
                field: key,
                got: got.to_string(),
                want: want.to_string(),
            });
        }
        Ok(())
    }

    /// Validates every field per the spec's VerityOutput contract and returns the 16-byte root
    /// hash.
    pub fn validate(&self, data_sectors: u64) -> Result<[u8; HASH_SIZE as usize], VerityOutputError> {
        self.require_eq("Data blocks", &data_sectors.to_string())?;
        self.require_eq("Data block size", &DATA_BLOCK.to_string())?;
        self.require_eq("Hash block size", &DATA_BLOCK.to_string())?;
        self.require_eq("Salt", "-")?;
        let root_hash_hex = self.require("Root hash")?;
        let want_len = 2 * HASH_SIZE as usize;
        if root_hash_hex.len() != want_len {
            return Err(VerityOutputError::BadRootHash(
                root_hash_hex.to_string(),
                want_len,
            ));
        }
        let bytes = hex::decode(root_hash_hex).map_err(|_| {
            VerityOutputError::BadRootHash(root_hash_hex.to_string(), want_len)
        })?;
        let mut out = [0u8; HASH_SIZE as usize];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// `R = linspace(r_max, 2, n)` rounded to integers and deduplicated, where `n = min(r_max - 1,
/// physical_cpu_count)`. Caps work at exactly one verity job per core.
pub fn candidate_roots(r_max: u8, cpu_count: usize) -> Vec<u8> {
    if r_max < MIN_FEC_ROOTS {
        return vec![];
    }
    let span = (r_max - MIN_FEC_ROOTS) as usize;
    let n = (r_max as usize - 1).min(cpu_count.max(1)).max(1);
    if n <= 1 {
        return vec![r_max];
    }
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let frac = i as f64 / (n - 1) as f64;
        let r = r_max as f64 - frac * span as f64;
        out.push(r.round() as u8);
    }
    out.dedup();
    out
}

pub struct VerityTrial {
    pub roots: u8,
    pub root_hash: [u8; HASH_SIZE as usize],
    pub hash_path: PathBuf,
    pub fec_path: PathBuf,
}

/// Runs `veritysetup format` at every value of `roots`, gated by a semaphore sized to
/// `cpu_count` concurrent process starts, reporting aggregate byte progress on `progress` as
/// the on-disk hash/fec files grow. Returns one `VerityTrial` per candidate, all sharing the
/// same root hash (a cross-task invariant this function asserts before returning).
pub async fn run_candidates(
    image_path: &Path,
    data_sectors: u64,
    hash_sectors: u64,
    roots: &[u8],
    cpu_count: usize,
) -> Result<Vec<VerityTrial>> {
    ensure!(!roots.is_empty(), "no candidate FEC-roots values to try");

    let payload_bytes = (data_sectors + hash_sectors) * DATA_BLOCK;
    let total_bytes: u64 = roots
        .iter()
        .map(|r| hash_sectors * DATA_BLOCK + fec_bytes(payload_bytes, *r))
        .sum();

    let bar = ProgressBar::new(total_bytes);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let semaphore = Arc::new(Semaphore::new(cpu_count.max(1)));
    let image_path = Arc::new(image_path.to_path_buf());

    let mut tasks = Vec::with_capacity(roots.len());
    for &r in roots {
        let semaphore = Arc::clone(&semaphore);
        let image_path = Arc::clone(&image_path);
        tasks.push(tokio::spawn(async move {
            run_one(&image_path, data_sectors, hash_sectors, r, semaphore).await
        }));
    }

    let progress_paths: Vec<(PathBuf, PathBuf)> = roots
        .iter()
        .map(|r| (sibling(&image_path, "hash", *r), sibling(&image_path, "fec", *r)))
        .collect();
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let mut remaining = tasks.len();
    let mut handles: Vec<_> = tasks.into_iter().map(Some).collect();

    let results = loop {
        poll.tick().await;
        let mut done = 0u64;
        for (hash_p, fec_p) in &progress_paths {
            done += file_len(hash_p) + file_len(fec_p);
        }
        bar.set_position(done.min(total_bytes));

        remaining = 0;
        for h in handles.iter() {
            if let Some(handle) = h {
                if !handle.is_finished() {
                    remaining += 1;
                }
            }
        }
        if remaining == 0 {
            let mut results = Vec::with_capacity(handles.len());
            for h in handles.iter_mut() {
                let handle = h.take().expect("handle present once remaining hits 0");
                results.push(handle.await.context("joining verity task")?);
            }
            break results;
        }
    };

    bar.finish_and_clear();

    let mut trials = Vec::with_capacity(results.len());
    for r in results {
        trials.push(r?);
    }

    let first_hash = trials[0].root_hash;
    for t in &trials[1..] {
        ensure!(
            t.root_hash == first_hash,
            "verity candidate r={} produced a different root hash than r={}; data region is not stable",
            t.roots,
            trials[0].roots
        );
    }

    Ok(trials)
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn sibling(image_path: &Path, kind: &str, roots: u8) -> PathBuf {
    let mut s = image_path.as_os_str().to_owned();
    s.push(format!(".{kind}_{roots}"));
    PathBuf::from(s)
}

async fn run_one(
    image_path: &Path,
    data_sectors: u64,
    hash_sectors: u64,
    roots: u8,
    semaphore: Arc<Semaphore>,
) -> Result<VerityTrial> {
    ensure!(
        (MIN_FEC_ROOTS..=MAX_FEC_ROOTS).contains(&roots),
        "fec roots {} out of range",
        roots
    );
    let hash_path = sibling(image_path, "hash", roots);
    let fec_path = sibling(image_path, "fec", roots);
    let _ = std::fs::remove_file(&hash_path);
    let _ = std::fs::remove_file(&fec_path);

    let permit = semaphore
        .acquire_owned()
        .await
        .context("acquiring verity concurrency permit")?;

    let output = Command::new("veritysetup")
        .arg("format")
        .arg("--salt=-")
        .arg("--hash=md5")
        .arg(format!("--fec-roots={roots}"))
        .arg("--data-block-size=2048")
        .arg("--hash-block-size=2048")
        .arg(format!("--fec-device={}", fec_path.display()))
        .arg(image_path)
        .arg(&hash_path)
        .output()
        .await
        .with_context(|| format!("spawning veritysetup format (roots={roots})"));
    drop(permit);
    let output = output?;

    if !output.status.success() {
        bail!(
            "veritysetup format (roots={}) failed with {}: {}",
            roots,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let hash_len = std::fs::metadata(&hash_path)
        .with_context(|| format!("statting {}", hash_path.display()))?
        .len();
    ensure!(
        hash_len == hash_sectors * DATA_BLOCK,
        "hash tree for roots={} is {} bytes, expected {}",
        roots,
        hash_len,
        hash_sectors * DATA_BLOCK
    );

    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("decoding veritysetup stdout (roots={roots})"))?;
    let parsed = VerityOutput::parse(&stdout);
    let root_hash = parsed
        .validate(data_sectors)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("validating veritysetup output (roots={roots})"))?;

    Ok(VerityTrial {
        roots,
        root_hash,
        hash_path,
        fec_path,
    })
}

/// Deletes every candidate's hash/fec siblings except the chosen one's.
pub fn cleanup_losers(trials: &[VerityTrial], chosen_roots: u8) {
    for t in trials {
        if t.roots == chosen_roots {
            continue;
        }
        let _ = std::fs::remove_file(&t.hash_path);
        let _ = std::fs::remove_file(&t.fec_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output(root_hash: &str, data_blocks: u64) -> String {
        format!(
            "VERITY header information for image\n\
             UUID:            \t00000000-0000-0000-0000-000000000000\n\
             Hash type:       \t1\n\
             Data blocks:     \t{data_blocks}\n\
             Data block size: \t2048\n\
             Hash block size: \t2048\n\
             Hash algorithm:  \tmd5\n\
             Salt:            \t-\n\
             Root hash:       \t{root_hash}\n"
        )
    }

    #[test]
    fn parses_and_validates_well_formed_output() {
        let hash = "00112233445566778899aabbccddeeff";
        let hash32 = &hash[..32];
        let text = sample_output(hash32, 520);
        let parsed = VerityOutput::parse(&text);
        let root = parsed.validate(520).unwrap();
        assert_eq!(hex::encode(root), hash32);
    }

    #[test]
    fn rejects_missing_field() {
        let text = "Data blocks:\t520\nData block size:\t2048\n";
        let parsed = VerityOutput::parse(text);
        assert!(matches!(
            parsed.validate(520),
            Err(VerityOutputError::MissingField("Hash block size"))
        ));
    }

    #[test]
    fn rejects_wrong_data_blocks() {
        let hash32 = "00112233445566778899aabbccddeeff";
        let text = sample_output(hash32, 999);
        let parsed = VerityOutput::parse(&text);
        assert!(matches!(
            parsed.validate(520),
            Err(VerityOutputError::UnexpectedValue { field: "Data blocks", .. })
        ));
    }

    #[test]
    fn rejects_bad_root_hash_length() {
        let text = sample_output("deadbeef", 520);
        let parsed = VerityOutput::parse(&text);
        assert!(matches!(
            parsed.validate(520),
            Err(VerityOutputError::BadRootHash(_, 32))
        ));
    }

    #[test]
    fn candidate_roots_spans_range_and_dedups() {
        let r = candidate_roots(24, 4);
        assert_eq!(r.first().copied(), Some(24));
        assert_eq!(r.last().copied(), Some(2));
        assert!(r.len() <= 5);
        let mut sorted = r.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), r.len(), "candidate_roots must already be deduped");
    }

    #[test]
    fn candidate_roots_single_cpu_tries_only_one_value() {
        // n = min(r_max - 1, cpu_count) caps work at one verity job per core: with a single
        // core the only candidate tried is r_max itself.
        let r = candidate_roots(24, 1);
        assert_eq!(r, vec![24]);
    }

    #[test]
    fn candidate_roots_caps_job_count_at_cpu_count() {
        let r = candidate_roots(24, 4);
        assert_eq!(r.len(), 4, "one verity job per core, not cpu_count + 1");
    }

    #[test]
    fn candidate_roots_empty_when_max_below_minimum() {
        assert!(candidate_roots(1, 4).is_empty());
    }
}
