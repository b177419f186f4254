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

//! ISO Producer: wraps `xorriso -as mkisofs` to build a Rock Ridge + Joliet ISO-9660 image
//! from either the plaintext data directory or the `.rootdir` produced by the Payload
//! Encryptor. `-no-pad` is load-bearing: the geometry module assumes the ISO lands at exactly
//! `data_sectors * 2048` bytes with no trailing xorriso padding for the assembler to trim.

use std::path::Path;

use anyhow::Result;

use crate::util::cmd_output;

pub fn build_iso(source_dir: &Path, output: &Path, volume_label: &str) -> Result<()> {
    let _ = std::fs::remove_file(output);
    let mut cmd = std::process::Command::new("xorriso");
    cmd.args(["-as", "mkisofs", "-verbose", "-iso-level", "4", "-r", "-J", "-joliet-long", "-no-pad"])
        .arg("-V")
        .arg(volume_label)
        .arg("-o")
        .arg(output)
        .arg(source_dir);
    cmd_output(&mut cmd).map(|_| ())
}
