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

//! Orchestrator (C7): the ten-step sequence from spec.md §4.7, wiring the Payload Encryptor,
//! ISO Producer, Extent Locator, Geometry, Boot Script Templater, and Verity Runner into one
//! pipeline run.

use std::io::{self, Write};

use anyhow::{Context, Result};

use crate::assembler::ImageAssembler;
use crate::bootscript::{self, build_substitutions};
use crate::cmdline::Config;
use crate::encrypt::{self, CIPHER_NULL};
use crate::extent;
use crate::geometry::Geometry;
use crate::iso;
use crate::privilege::{self, PrivilegeHelper, SudoHelper};
use crate::select;
use crate::verity;

pub async fn run(config: Config) -> Result<()> {
    let needs_privilege = config.compress.is_some();
    let helper: Option<std::sync::Arc<dyn PrivilegeHelper>> = if needs_privilege {
        let helper = std::sync::Arc::new(SudoHelper::new(config.bpassword.clone()));
        helper
            .validate()
            .await
            .context("pre-validating privilege helper password")?;
        Some(helper)
    } else {
        None
    };
    let _revalidation = helper
        .clone()
        .map(privilege::spawn_revalidation);

    if config.save_pass {
        let key = config
            .compress
            .as_ref()
            .expect("--save_pass always sets compress to a generated key");
        println!(
            "generated encryption key (base64, save this now): {}",
            base64::encode(key)
        );
    }

    let cipher;
    let source_dir;
    let mut extent_info = None;

    if let Some(key) = &config.compress {
        let helper = helper.as_ref().expect("privilege helper present when compress is set");
        let invoking_user = nix::unistd::User::from_uid(nix::unistd::Uid::current())
            .context("looking up invoking user")?
            .context("invoking uid has no /etc/passwd entry")?
            .name;
        let payload = encrypt::encrypt_payload(
            helper.as_ref(),
            &config.data_dir,
            &config.output,
            &config.volid.dmid(),
            key,
            &invoking_user,
        )
        .await
        .context("running payload encryptor")?;
        cipher = payload.cipher;
        source_dir = payload.rootdir.clone();

        iso::build_iso(&source_dir, &config.output, &config.volid.volume_label())
            .context("producing ISO over encrypted payload")?;
        let mountpoint = config.output.with_extension("mnt");
        let squashfs_name = format!("{}.sqfs", config.volid.dmid());
        let located = extent::locate_payload_extent(
            helper.as_ref(),
            &config.output,
            &mountpoint,
            &squashfs_name,
        )
        .await
        .context("running extent locator")?;
        extent_info = Some(located);
    } else {
        cipher = CIPHER_NULL;
        source_dir = config.data_dir.clone();
        iso::build_iso(&source_dir, &config.output, &config.volid.volume_label())
            .context("producing ISO over plaintext payload")?;
    }

    let iso_len = std::fs::metadata(&config.output)
        .context("statting produced ISO")?
        .len();

    let hint_str = config.hint.as_ref().map(|h| h.as_str().to_string());
    let disc_str = config.disc_id.as_ref().map(|d| d.to_string());
    // Base64-encoded rather than treated as UTF-8: a `--save_pass` key is 16 random bytes,
    // not text, and a user-typed `-C` passcode is re-encoded the same way so the boot
    // script's `_PASS` substitution always holds one well-defined representation.
    let pass_str = config
        .compress
        .as_ref()
        .filter(|k| !k.is_empty())
        .map(|k| base64::encode(k));

    let geometry = Geometry::compute(iso_len).context("computing disc geometry")?;
    // `Geometry::compute` already warned and forced r=24 when no profile fits; the image is
    // still built (spec.md §3/§7), just with zero reported slack, so this is not fatal.
    let profile_total_sectors = geometry.profile.map(|p| p.total_sectors).unwrap_or(0);

    let substitutions = build_substitutions(
        iso_len,
        geometry.hash_sectors * 2048,
        &config.volid.dmid(),
        extent_info.map(|e| e.offset),
        extent_info.map(|e| e.length),
        Some(cipher),
        pass_str.as_deref(),
        disc_str.as_deref(),
        hint_str.as_deref(),
    );
    let boot_script = bootscript::render(bootscript::BOOT_TEMPLATE, substitutions)
        .context("rendering boot script")?;

    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let candidates = verity::candidate_roots(geometry.selected_fec_roots, cpu_count);
    let trials = verity::run_candidates(
        &config.output,
        geometry.data_sectors,
        geometry.hash_sectors,
        &candidates,
        cpu_count,
    )
    .await
    .context("running verity formatter over candidate roots")?;

    let menu = select::format_candidate_menu(
        &candidates,
        geometry.data_sectors,
        geometry.hash_sectors,
        profile_total_sectors,
    );
    let chosen_roots = prompt_operator(&menu, &candidates)?;

    let chosen = trials
        .iter()
        .find(|t| t.roots == chosen_roots)
        .expect("operator's choice was validated against the candidate set");
    let root_hash = chosen.root_hash;
    let hash_path = chosen.hash_path.clone();
    let fec_path = chosen.fec_path.clone();
    let fec_len = std::fs::metadata(&fec_path)
        .context("statting chosen FEC parity file")?
        .len();

    {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.output)
            .context("reopening image for assembly")?;
        let mut asm = ImageAssembler::new(&mut file);
        asm.patch_boot_area(&boot_script.header, &boot_script.body, geometry.data_sectors)?;
        asm.append_hash_tree(&hash_path, geometry.hash_sectors)?;
        asm.stamp_root(geometry.data_sectors, &root_hash, chosen_roots)?;
        asm.append_fec(&fec_path, fec_len)?;
        asm.pad_cluster_tail(&root_hash)?;
    }

    verity::cleanup_losers(&trials, chosen_roots);

    let final_len = std::fs::metadata(&config.output)
        .context("statting assembled image")?
        .len();
    println!(
        "root hash: {}\nimage size: {}",
        hex::encode(root_hash),
        crate::geometry::format_bytes(final_len)
    );
    Ok(())
}

fn prompt_operator(menu: &str, candidates: &[u8]) -> Result<u8> {
    loop {
        print!("choose FEC roots [{menu}]: ");
        io::stdout().flush().ok();
        let mut line = String::new();
        io::stdin()
            .read_line(&mut line)
            .context("reading operator's FEC-roots choice")?;
        match select::parse_operator_choice(&line, candidates) {
            Ok(r) => return Ok(r),
            Err(e) => eprintln!("{e}; choices are [{menu}]"),
        }
    }
}
