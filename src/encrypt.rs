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

//! Payload Encryptor (C5): packs the user's data directory into a squashfs, pre-allocates a
//! same-size sibling file, streams the squashfs bytes through a plain dm-crypt mapping (or
//! `cipher_null` when no key was supplied), and atomically replaces the squashfs with the
//! resulting ciphertext. Opening/closing the dm-crypt mapping and chowning the resulting
//! `/dev/mapper` node require root, so those three steps go through the same `PrivilegeHelper`
//! C6 uses for mount/umount/filefrag (spec.md §6 lists `cryptsetup open/close` and `chown`
//! among the `sudo -S` commands).

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};

use crate::privilege::PrivilegeHelper;
use crate::util::{cmd_output, copy_exactly_n, BUFFER_SIZE};

pub const CIPHER_AES_XTS: &str = "aes-xts-plain64";
pub const CIPHER_NULL: &str = "cipher_null";

pub struct EncryptedPayload {
    /// Directory containing the (now encrypted) squashfs, suitable as the ISO producer's source.
    pub rootdir: PathBuf,
    pub sqfs_path: PathBuf,
    pub cipher: &'static str,
}

/// Runs the full C5 pipeline for one pipeline invocation. `key` is the raw plain dm-crypt key;
/// an empty key still runs the pipeline with `cipher_null` so every encrypted image has the
/// same on-disk layout regardless of whether a real key was used. `invoking_user` is the
/// non-root user the `/dev/mapper` node is chowned to after `cryptsetup open`.
pub async fn encrypt_payload(
    helper: &dyn PrivilegeHelper,
    data_dir: &Path,
    image_path: &Path,
    dmid: &str,
    key: &[u8],
    invoking_user: &str,
) -> Result<EncryptedPayload> {
    let rootdir = image_path.with_extension("rootdir");
    std::fs::create_dir_all(&rootdir)
        .with_context(|| format!("creating {}", rootdir.display()))?;
    let sqfs_path = rootdir.join(format!("{dmid}.sqfs"));
    let _ = std::fs::remove_file(&sqfs_path);

    mksquashfs(data_dir, &sqfs_path)?;

    let crypt_path = sqfs_path.with_extension("sqfs.crypt");
    let sqfs_len = std::fs::metadata(&sqfs_path)
        .with_context(|| format!("statting {}", sqfs_path.display()))?
        .len();
    fallocate(&crypt_path, sqfs_len)?;

    let cipher = if key.is_empty() {
        CIPHER_NULL
    } else {
        CIPHER_AES_XTS
    };
    let mapper_name = format!("{dmid}_crypt");

    open_plain_crypt(helper, &crypt_path, &mapper_name, cipher, key).await?;
    let mapper_path = PathBuf::from(format!("/dev/mapper/{mapper_name}"));
    chown_mapper(helper, &mapper_path, invoking_user).await?;

    let stream_result = stream_into_mapper(&sqfs_path, &mapper_path);
    let close_result = close_crypt(helper, &mapper_name).await;
    stream_result?;
    close_result?;

    std::fs::rename(&crypt_path, &sqfs_path)
        .with_context(|| format!("renaming {} over {}", crypt_path.display(), sqfs_path.display()))?;

    Ok(EncryptedPayload {
        rootdir,
        sqfs_path,
        cipher,
    })
}

fn mksquashfs(data_dir: &Path, sqfs_path: &Path) -> Result<()> {
    let mut cmd = std::process::Command::new("mksquashfs");
    cmd.arg(data_dir)
        .arg(sqfs_path)
        .args(["-b", "1M", "-all-root", "-comp", "zstd", "-Xcompression-level", "22"]);
    cmd_output(&mut cmd).map(|_| ())
}

fn fallocate(path: &Path, len: u64) -> Result<()> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut cmd = std::process::Command::new("fallocate");
    cmd.arg("-x").arg("-l").arg(len.to_string()).arg(path);
    cmd_output(&mut cmd).map(|_| ())
}

async fn open_plain_crypt(
    helper: &dyn PrivilegeHelper,
    backing_file: &Path,
    mapper_name: &str,
    cipher: &str,
    key: &[u8],
) -> Result<()> {
    let backing_str = backing_file.to_string_lossy().into_owned();
    let cipher_arg = format!("--cipher={cipher}");
    helper
        .run_with_stdin(
            "cryptsetup",
            &[
                "open",
                "--type",
                "plain",
                &cipher_arg,
                "--hash=sha512",
                "--key-size=512",
                "--key-file=-",
                &backing_str,
                mapper_name,
            ],
            key,
        )
        .await
        .map(|_| ())
}

async fn close_crypt(helper: &dyn PrivilegeHelper, mapper_name: &str) -> Result<()> {
    helper.run("cryptsetup", &["close", mapper_name]).await.map(|_| ())
}

async fn chown_mapper(helper: &dyn PrivilegeHelper, mapper_path: &Path, invoking_user: &str) -> Result<()> {
    let mapper_str = mapper_path.to_string_lossy().into_owned();
    helper.run("chown", &[invoking_user, &mapper_str]).await.map(|_| ())
}

fn stream_into_mapper(sqfs_path: &Path, mapper_path: &Path) -> Result<()> {
    let mut src = std::fs::File::open(sqfs_path)
        .with_context(|| format!("opening {}", sqfs_path.display()))?;
    let len = src
        .metadata()
        .with_context(|| format!("statting {}", sqfs_path.display()))?
        .len();
    let mut dst = std::fs::OpenOptions::new()
        .write(true)
        .open(mapper_path)
        .with_context(|| format!("opening {}", mapper_path.display()))?;
    let mut buf = vec![0u8; BUFFER_SIZE];
    let written = copy_exactly_n(&mut src, &mut dst, len, &mut buf)
        .with_context(|| format!("streaming plaintext into {}", mapper_path.display()))?;
    ensure!(
        written == len,
        "streamed {} bytes into mapper device but squashfs is {} bytes",
        written,
        len
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_choice_matches_key_presence() {
        // exercised indirectly through encrypt_payload in integration tests that require
        // mksquashfs/cryptsetup on PATH; here we only pin the public constants' values, since
        // the boot script template and the pipeline both key off these exact strings.
        assert_eq!(CIPHER_NULL, "cipher_null");
        assert_eq!(CIPHER_AES_XTS, "aes-xts-plain64");
    }
}
