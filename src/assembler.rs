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

//! Image Assembler (C3): splices the boot header/body, hash tree, root hash, selected FEC
//! roots byte, and FEC parity into the finished image file at exact byte offsets, then pads
//! the tail to a 64 KiB cluster boundary with repeated root-hash copies.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::geometry::{CLUSTER, DATA_BLOCK, HASH_SIZE};
use crate::util::{copy_exactly_n, BUFFER_SIZE};

pub struct ImageAssembler<'a> {
    file: &'a mut File,
}

impl<'a> ImageAssembler<'a> {
    pub fn new(file: &'a mut File) -> Self {
        Self { file }
    }

    /// Step 1: write header at offset 0, body at offset 512; zero-pad to the next sector if
    /// the producer's output wasn't already sector-aligned. Post-condition: file length is
    /// exactly `data_sectors * 2048`.
    pub fn patch_boot_area(&mut self, header: &[u8], body: &[u8], data_sectors: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .context("seeking to boot header offset")?;
        self.file.write_all(header).context("writing boot header")?;
        self.file
            .seek(SeekFrom::Start(512))
            .context("seeking to boot body offset")?;
        self.file.write_all(body).context("writing boot body")?;

        let expected_len = data_sectors * DATA_BLOCK;
        let cur_len = self
            .file
            .metadata()
            .context("statting image file")?
            .len();
        ensure!(
            cur_len <= expected_len,
            "ISO payload ({} bytes) is larger than data_sectors implies ({} bytes)",
            cur_len,
            expected_len
        );
        if cur_len < expected_len {
            self.file
                .set_len(expected_len)
                .context("zero-padding ISO to sector boundary")?;
        }
        Ok(())
    }

    /// Step 2: append the chosen hash-tree file at `data_sectors * 2048`.
    pub fn append_hash_tree(&mut self, hash_path: &Path, hash_sectors: u64) -> Result<()> {
        let offset = self.file.metadata().context("statting image file")?.len();
        self.file
            .seek(SeekFrom::Start(offset))
            .context("seeking to end of ISO payload")?;
        let mut hash_file =
            File::open(hash_path).with_context(|| format!("opening {}", hash_path.display()))?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let n = copy_exactly_n(
            &mut hash_file,
            self.file,
            hash_sectors * DATA_BLOCK,
            &mut buf,
        )
        .with_context(|| format!("copying hash tree from {}", hash_path.display()))?;
        ensure!(
            n == hash_sectors * DATA_BLOCK,
            "hash tree file {} is not {} bytes",
            hash_path.display(),
            hash_sectors * DATA_BLOCK
        );
        Ok(())
    }

    /// Step 3: assert the 16-byte root-hash slot (at `data_sectors*2048 + 512`) is zero, then
    /// overwrite it with `root_hash`, followed by a single `selected_fec_roots` byte.
    pub fn stamp_root(
        &mut self,
        data_sectors: u64,
        root_hash: &[u8; HASH_SIZE as usize],
        selected_fec_roots: u8,
    ) -> Result<()> {
        let root_off = data_sectors * DATA_BLOCK + 512;
        self.file
            .seek(SeekFrom::Start(root_off))
            .context("seeking to root hash slot")?;
        let mut existing = [0u8; HASH_SIZE as usize];
        self.file
            .read_exact(&mut existing)
            .context("reading root hash slot")?;
        ensure!(
            existing.iter().all(|b| *b == 0),
            "root hash slot at offset {} is not zero; refusing to overwrite",
            root_off
        );
        self.file
            .seek(SeekFrom::Start(root_off))
            .context("seeking to root hash slot")?;
        self.file
            .write_all(root_hash)
            .context("writing root hash")?;
        self.file
            .write_all(&[selected_fec_roots])
            .context("writing selected FEC roots byte")?;
        Ok(())
    }

    /// Step 4: append the chosen FEC parity file at the current end of file.
    pub fn append_fec(&mut self, fec_path: &Path, expected_len: u64) -> Result<()> {
        let offset = self.file.metadata().context("statting image file")?.len();
        self.file
            .seek(SeekFrom::Start(offset))
            .context("seeking to end of hash tree")?;
        let mut fec_file =
            File::open(fec_path).with_context(|| format!("opening {}", fec_path.display()))?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let n = copy_exactly_n(&mut fec_file, self.file, expected_len, &mut buf)
            .with_context(|| format!("copying FEC parity from {}", fec_path.display()))?;
        if n != expected_len {
            bail!(
                "FEC parity file {} is not {} bytes",
                fec_path.display(),
                expected_len
            );
        }
        Ok(())
    }

    /// Step 5: pad the tail to a 64 KiB cluster boundary with repeated copies of `root_hash`.
    pub fn pad_cluster_tail(&mut self, root_hash: &[u8; HASH_SIZE as usize]) -> Result<()> {
        let len = self.file.metadata().context("statting image file")?.len();
        let rem = len % CLUSTER;
        if rem == 0 {
            return Ok(());
        }
        let pad_total = CLUSTER - rem;
        let zero_bytes = pad_total % HASH_SIZE;
        let hash_copies = pad_total / HASH_SIZE;

        self.file.seek(SeekFrom::End(0)).context("seeking to end of image")?;
        if zero_bytes > 0 {
            self.file
                .write_all(&vec![0u8; zero_bytes as usize])
                .context("writing cluster pad zero bytes")?;
        }
        for _ in 0..hash_copies {
            self.file
                .write_all(root_hash)
                .context("writing root hash tail copy")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn sample_root_hash() -> [u8; 16] {
        let mut h = [0u8; 16];
        for (i, b) in h.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        h
    }

    #[test]
    fn full_pipeline_produces_cluster_aligned_layout() {
        let mut iso = NamedTempFile::new().unwrap();
        // 3 sectors of "ISO" content, unaligned on purpose (patch_boot_area should pad it).
        iso.write_all(&vec![0xAAu8; 3 * 2048 - 100]).unwrap();
        let iso_path = iso.path().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&iso_path)
            .unwrap();

        let data_sectors = 3u64;
        let hash_sectors = 1u64;

        let mut hash_file = NamedTempFile::new().unwrap();
        hash_file.write_all(&vec![0u8; (hash_sectors * 2048) as usize]).unwrap();

        let fec_len = 777u64;
        let mut fec_file = NamedTempFile::new().unwrap();
        fec_file.write_all(&vec![0x11u8; fec_len as usize]).unwrap();

        let root_hash = sample_root_hash();

        let mut asm = ImageAssembler::new(&mut file);
        asm.patch_boot_area(&[1, 2, 3], &[4, 5, 6], data_sectors).unwrap();
        assert_eq!(file.metadata().unwrap().len(), data_sectors * 2048);

        asm.append_hash_tree(hash_file.path(), hash_sectors).unwrap();
        assert_eq!(
            file.metadata().unwrap().len(),
            (data_sectors + hash_sectors) * 2048
        );

        let root_hash = sample_root_hash();
        asm.stamp_root(data_sectors, &root_hash, 17).unwrap();

        let fec_file2 = fec_file;
        asm.append_fec(fec_file2.path(), fec_len).unwrap();
        let before_tail = file.metadata().unwrap().len();
        assert_eq!(
            before_tail,
            (data_sectors + hash_sectors) * 2048 + fec_len
        );

        asm.pad_cluster_tail(&root_hash).unwrap();
        assert_eq!(file.metadata().unwrap().len() % CLUSTER, 0);

        let root_off = data_sectors * 2048 + 512;
        let mut stamped = [0u8; 16];
        file.seek(SeekFrom::Start(root_off)).unwrap();
        file.read_exact(&mut stamped).unwrap();
        assert_eq!(stamped, root_hash);
        let mut roots_byte = [0u8; 1];
        file.read_exact(&mut roots_byte).unwrap();
        assert_eq!(roots_byte[0], 17);
    }

    #[test]
    fn stamp_root_rejects_nonzero_slot() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 4096]).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        let mut asm = ImageAssembler::new(&mut file);
        asm.stamp_root(1, &sample_root_hash(), 24).unwrap();
        // slot is no longer zero; stamping again must fail.
        assert!(asm.stamp_root(1, &sample_root_hash(), 24).is_err());
    }

    #[test]
    fn pad_cluster_tail_aligns_and_repeats_root_hash() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0xFFu8; 100]).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        let root_hash = sample_root_hash();
        let mut asm = ImageAssembler::new(&mut file);
        asm.pad_cluster_tail(&root_hash).unwrap();
        let len = file.metadata().unwrap().len();
        assert_eq!(len % CLUSTER, 0);

        let rem = 100u64 % CLUSTER;
        let pad_total = CLUSTER - rem;
        let zero_bytes = pad_total % HASH_SIZE;
        let hash_copies = pad_total / HASH_SIZE;

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(100)).unwrap();
        file.read_to_end(&mut buf).unwrap();
        assert_eq!(buf[..zero_bytes as usize], vec![0u8; zero_bytes as usize][..]);
        for i in 0..hash_copies as usize {
            let start = zero_bytes as usize + i * 16;
            assert_eq!(&buf[start..start + 16], &root_hash[..]);
        }
    }
}
