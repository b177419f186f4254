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

//! Extent Locator (C6): mounts the produced ISO read-only, asks `filefrag -e` where the
//! squashfs payload physically landed, and converts that answer into the byte offset/length
//! the boot script needs to open its dm-crypt mapping directly against the optical media.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ExtentError;
use crate::privilege::{mount_iso, umount_iso, PrivilegeHelper};

/// Physical byte offset/length of the squashfs payload inside the produced ISO, already scaled
/// by the 512-byte-sector-to-byte factor the boot script expects (spec.md's Open Question
/// (iii): `filefrag` reports 512-byte-sector units regardless of the filesystem's block size,
/// so both fields are multiplied by 4 to land in bytes for a 2048-byte-block filesystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadExtent {
    pub offset: u64,
    pub length: u64,
}

const SECTOR_TO_BYTE_SCALE: u64 = 4;

lazy_static! {
    static ref BLOCK_SIZE_RE: Regex = Regex::new(r"\(([\w\s]+)\)").unwrap();
    static ref EXTENT_ROW_RE: Regex =
        Regex::new(r"^\s*\d+:\s*(\d+)\.\.\s*(\d+):\s*(\d+)\.\.\s*(\d+):\s*(\d+):?").unwrap();
    static ref SUMMARY_RE: Regex = Regex::new(r":\s*(\d+)\s+extent").unwrap();
}

/// Mounts `iso_path`, locates `squashfs_name` inside it, and returns its physical extent.
/// Unmounts on every path, including early returns from a parse failure.
pub async fn locate_payload_extent(
    helper: &dyn PrivilegeHelper,
    iso_path: &Path,
    mountpoint: &Path,
    squashfs_name: &str,
) -> Result<PayloadExtent> {
    mount_iso(helper, iso_path, mountpoint).await?;
    let result = locate_inner(helper, mountpoint, squashfs_name).await;
    umount_iso(helper, mountpoint).await?;
    result
}

async fn locate_inner(
    helper: &dyn PrivilegeHelper,
    mountpoint: &Path,
    squashfs_name: &str,
) -> Result<PayloadExtent> {
    let target = mountpoint.join(squashfs_name);
    let target_str = target.to_string_lossy().into_owned();
    let stdout = helper
        .run("filefrag", &["-e", &target_str])
        .await
        .context("running filefrag -e")?;
    parse_filefrag(&stdout, &target_str)
}

fn parse_filefrag(stdout: &str, path: &str) -> Result<PayloadExtent> {
    let mut lines = stdout.lines();
    let _header = lines.next().context("filefrag output is empty")?;
    let blocks_line = lines.next().context("filefrag output missing blocks line")?;

    let caps = BLOCK_SIZE_RE
        .captures(blocks_line)
        .with_context(|| format!("could not find block size in: {blocks_line}"))?;
    let inner = caps.get(1).unwrap().as_str();
    let block_size: u64 = inner
        .split_whitespace()
        .nth_back(1)
        .with_context(|| format!("could not parse block size from: {inner}"))?
        .parse()
        .with_context(|| format!("block size in `{inner}` is not a number"))?;
    if block_size != 2048 {
        return Err(ExtentError::WrongBlockSize(block_size).into());
    }

    let mut extent_rows = Vec::new();
    let mut summary_line = None;
    for line in lines {
        if let Some(caps) = EXTENT_ROW_RE.captures(line) {
            let logical_start: u64 = caps[1].parse()?;
            let logical_end: u64 = caps[2].parse()?;
            let physical_start: u64 = caps[3].parse()?;
            let physical_end: u64 = caps[4].parse()?;
            extent_rows.push((logical_start, logical_end, physical_start, physical_end));
        } else if line.contains("extent") && line.contains(':') {
            summary_line = Some(line);
        }
    }

    if let Some(summary) = summary_line {
        if let Some(caps) = SUMMARY_RE.captures(summary) {
            let n: usize = caps[1].parse().unwrap_or(0);
            if n != extent_rows.len() {
                return Err(ExtentError::WrongExtentCount {
                    path: path.to_string(),
                    found: extent_rows.len(),
                }
                .into());
            }
        }
    }

    if extent_rows.len() != 1 {
        return Err(ExtentError::WrongExtentCount {
            path: path.to_string(),
            found: extent_rows.len(),
        }
        .into());
    }
    let (logical_start, logical_end, physical_start, physical_end) = extent_rows[0];
    ensure!(
        logical_start == 0,
        "expected the sole extent of {} to start at logical offset 0, found {}",
        path,
        logical_start
    );
    let length = logical_end - logical_start + 1;
    ensure!(
        physical_end - physical_start + 1 == length,
        "extent physical span of {} doesn't match its logical length {}",
        path,
        length
    );

    Ok(PayloadExtent {
        offset: physical_start * SECTOR_TO_BYTE_SCALE,
        length: length * SECTOR_TO_BYTE_SCALE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> &'static str {
        "Filesystem type is: iso9660\n\
         File size of /mnt/payload/mylabel.sqfs is 1048576 (512 blocks of 2048 bytes)\n\
         ext: logical_offset: physical_offset: length: expected: flags:\n\
         0: 0.. 511: 2048.. 2559: 512: last,eof\n\
         /mnt/payload/mylabel.sqfs: 1 extent found\n"
    }

    #[test]
    fn parses_single_extent() {
        let extent = parse_filefrag(sample_output(), "/mnt/payload/mylabel.sqfs").unwrap();
        assert_eq!(extent.offset, 2048 * SECTOR_TO_BYTE_SCALE);
        assert_eq!(extent.length, 512 * SECTOR_TO_BYTE_SCALE);
    }

    #[test]
    fn rejects_wrong_block_size() {
        let bad = sample_output().replace("2048 bytes", "4096 bytes");
        assert!(parse_filefrag(&bad, "x").is_err());
    }

    #[test]
    fn rejects_multiple_extents() {
        let mut bad = String::from(
            "Filesystem type is: iso9660\n\
             File size of x is 1048576 (512 blocks of 2048 bytes)\n\
             ext: logical_offset: physical_offset: length: expected: flags:\n",
        );
        bad.push_str("0: 0.. 255: 2048.. 2303: 256:\n");
        bad.push_str("1: 256.. 511: 4096.. 4351: 256: last,eof\n");
        bad.push_str("x: 2 extents found\n");
        assert!(parse_filefrag(&bad, "x").is_err());
    }
}
