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

// For consistency, have all parse_*() functions return Result.
#![allow(clippy::unnecessary_wraps)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_version, App, Arg, ArgMatches};

use crate::types::{DiscId, PassHint, VolId};

pub struct Config {
    pub data_dir: PathBuf,
    pub output: PathBuf,
    pub volid: VolId,
    pub compress: Option<Vec<u8>>,
    pub disc_id: Option<DiscId>,
    pub hint: Option<PassHint>,
    pub save_disc: bool,
    pub save_pass: bool,
    pub bpassword: Option<Vec<u8>>,
}

pub fn parse_args() -> Result<Config> {
    let app_matches = App::new("wormcast")
        .version(crate_version!())
        .about("Assembles a self-verifying, self-booting write-once optical disc image")
        .arg(
            Arg::with_name("data-dir")
                .value_name("data_dir")
                .help("Directory whose contents become the disc's payload")
                .required(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("path")
                .help("Output image path")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("volid")
                .short("V")
                .long("volid")
                .value_name("label")
                .help("Volume label / device-mapper id (<=15 chars)")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("compress")
                .short("C")
                .long("compress")
                .value_name("key")
                .help("Encrypt the payload; empty value still squashfs-packs it with cipher_null")
                .takes_value(true)
                .min_values(0),
        )
        .arg(
            Arg::with_name("disc")
                .short("d")
                .long("disc")
                .value_name("disc_id")
                .help("Disc media identifier recorded for the operator's reference")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("hint")
                .long("hint")
                .value_name("text")
                .help("Passphrase hint shown by the boot script")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("save-disc")
                .long("save_disc")
                .help("Persist the disc id choice instead of discarding it after this run"),
        )
        .arg(
            Arg::with_name("save-pass")
                .long("save_pass")
                .conflicts_with("compress")
                .help("Generate a random 16-byte key and print it base85-encoded instead of reading --compress"),
        )
        .arg(
            Arg::with_name("password-file")
                .long("password-file")
                .value_name("path")
                .help("Read the privilege helper's password from this file instead of a prompt")
                .takes_value(true),
        )
        .get_matches();

    parse_config(&app_matches)
}

fn parse_config(matches: &ArgMatches) -> Result<Config> {
    let data_dir = PathBuf::from(
        matches
            .value_of("data-dir")
            .context("data_dir is required")?,
    );
    let output = PathBuf::from(matches.value_of("output").context("--output is required")?);
    let volid = VolId::parse(matches.value_of("volid").context("--volid is required")?)
        .context("parsing --volid")?;

    let save_pass = matches.is_present("save-pass");
    let compress = if save_pass {
        Some(random_key())
    } else if matches.is_present("compress") {
        Some(
            matches
                .value_of("compress")
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
        )
    } else {
        None
    };

    let disc_id = matches
        .value_of("disc")
        .map(DiscId::parse)
        .transpose()
        .context("parsing --disc")?;
    let hint = matches
        .value_of("hint")
        .map(PassHint::parse)
        .transpose()
        .context("parsing --hint")?;

    let bpassword = matches
        .value_of("password-file")
        .map(std::fs::read)
        .transpose()
        .context("reading --password-file")?;

    Ok(Config {
        data_dir,
        output,
        volid,
        compress,
        disc_id,
        hint,
        save_disc: matches.is_present("save-disc"),
        save_pass,
        bpassword,
    })
}

fn random_key() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
