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

//! Geometry & Capacity (C1): pure, allocation-free arithmetic deciding how many sectors the
//! data, hash tree, and FEC parity regions occupy, and which disc profile the assembled image
//! targets. No I/O happens here; everything is a plain function so it's exhaustively testable.

use byte_unit::Byte;

use crate::error::GeometryError;

pub const DATA_BLOCK: u64 = 2048;
pub const HASH_SIZE: u64 = 16;
pub const HASH_FANOUT: u64 = DATA_BLOCK / HASH_SIZE; // 128
pub const CLUSTER: u64 = 65536;
pub const MIN_FEC_ROOTS: u8 = 2;
pub const MAX_FEC_ROOTS: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscProfile {
    pub name: &'static str,
    pub total_sectors: u64,
}

pub const DISC_PROFILES: &[DiscProfile] = &[
    DiscProfile {
        name: "DVD+R",
        total_sectors: 2_295_104,
    },
    DiscProfile {
        name: "DVD+R DL",
        total_sectors: 4_173_824,
    },
    DiscProfile {
        name: "BD-XL TL",
        total_sectors: 48_878_592,
    },
];

/// `hash_sectors(n) = 1 + sum_{k>=1} ceil(n / 128^k)`: one superblock sector plus one level of
/// the Merkle tree per power of the fan-out, continuing until a level collapses to zero.
/// Chains on the floor quotient (`q = level / 128`, `total += q + bool(remainder)`, `level =
/// q`), mirroring `fecsetup.py::_hs`'s `divmod` recurrence: the floor quotient strictly
/// decreases to 0, so the loop terminates, whereas re-dividing the rounded-up value (e.g.
/// `div_ceil`) gets stuck at 1 forever since `ceil(1/128) == 1`.
pub fn hash_sectors(data_sectors: u64) -> u64 {
    let mut total: u64 = 1; // superblock
    let mut level = data_sectors;
    while level > 0 {
        let q = level / HASH_FANOUT;
        let rem = level % HASH_FANOUT;
        total += q + (rem != 0) as u64;
        level = q;
    }
    total
}

/// Number of sectors occupied by the data region for an ISO file of `iso_bytes` bytes.
pub fn data_sectors(iso_bytes: u64) -> u64 {
    iso_bytes.div_ceil(DATA_BLOCK)
}

/// Reed-Solomon parity bytes for `payload_bytes` of protected data at `roots` FEC roots:
/// `ceil(payload_bytes / (255 - roots)) * roots`.
pub fn fec_bytes(payload_bytes: u64, roots: u8) -> u64 {
    assert!((MIN_FEC_ROOTS..=MAX_FEC_ROOTS).contains(&roots));
    let codeword_data = 255 - roots as u64;
    payload_bytes.div_ceil(codeword_data) * roots as u64
}

pub fn fec_sectors(payload_bytes: u64, roots: u8) -> u64 {
    fec_bytes(payload_bytes, roots).div_ceil(DATA_BLOCK)
}

/// The smallest disc profile whose total sector count is >= `need_sectors`, or `None` if no
/// profile is large enough.
pub fn pick_profile(need_sectors: u64) -> Option<DiscProfile> {
    DISC_PROFILES
        .iter()
        .filter(|p| p.total_sectors >= need_sectors)
        .min_by_key(|p| p.total_sectors)
        .copied()
}

/// The largest FEC roots value in [2,24] whose parity sectors still fit within
/// `profile_total - data - hash` sectors, or 0 if none fit.
pub fn pick_fec_roots(data: u64, hash: u64, profile_total: u64) -> u8 {
    let payload_bytes = (data + hash) * DATA_BLOCK;
    for r in (MIN_FEC_ROOTS..=MAX_FEC_ROOTS).rev() {
        let parity_sectors = fec_sectors(payload_bytes, r);
        if data + hash + parity_sectors <= profile_total {
            return r;
        }
    }
    0
}

pub struct Geometry {
    pub data_sectors: u64,
    pub hash_sectors: u64,
    pub profile: Option<DiscProfile>,
    /// The selected FEC roots; always in [2,24]. When no profile/roots combination fits, this
    /// is forced to 24 (no FEC fit) per spec.md's "image is still built, operator warned" rule.
    pub selected_fec_roots: u8,
}

impl Geometry {
    pub fn compute(iso_bytes: u64) -> Result<Self, GeometryError> {
        let data = data_sectors(iso_bytes);
        let hash = hash_sectors(data);
        let need = data + hash;
        let profile = pick_profile(need);
        let selected_fec_roots = match profile {
            Some(p) => {
                let r = pick_fec_roots(data, hash, p.total_sectors);
                if r == 0 {
                    eprintln!(
                        "warning: no FEC roots value fits in the remaining capacity of {}; building with r=24 and no error-correction margin",
                        p.name
                    );
                    MAX_FEC_ROOTS
                } else {
                    r
                }
            }
            None => {
                eprintln!("warning: data+hash region ({} sectors) exceeds every known disc profile; FEC is disabled (r=24, no profile)", need);
                MAX_FEC_ROOTS
            }
        };
        Ok(Self {
            data_sectors: data,
            hash_sectors: hash,
            profile,
            selected_fec_roots,
        })
    }
}

/// Human-readable binary-prefixed byte count (Ki, Mi, ..., Yi), for reporting only.
pub fn format_bytes(n: u64) -> String {
    Byte::from_bytes(n as u128)
        .get_appropriate_unit(true)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_sectors_fixed_points() {
        assert_eq!(hash_sectors(0), 1);
        assert_eq!(hash_sectors(128), 3);
        assert_eq!(hash_sectors(128 * 128), 131);
    }

    #[test]
    fn hash_sectors_monotone() {
        let mut prev = hash_sectors(0);
        for n in (1u64..20_000).step_by(37) {
            let cur = hash_sectors(n);
            assert!(cur >= prev, "hash_sectors not monotone at n={}", n);
            prev = cur;
        }
    }

    #[test]
    fn fec_bytes_increasing_in_roots() {
        let payload = 1_000_000u64;
        let mut prev = 0u64;
        for r in MIN_FEC_ROOTS..=MAX_FEC_ROOTS {
            let cur = fec_bytes(payload, r);
            assert!(cur > prev, "fec_bytes not strictly increasing at r={}", r);
            prev = cur;
        }
    }

    #[test]
    fn fec_bytes_matches_closed_form() {
        for n in [1u64, 2, 520, 1_000_000] {
            for r in [2u8, 10, 24] {
                let payload = n * DATA_BLOCK;
                let expected = (payload + (255 - r as u64) - 1) / (255 - r as u64) * r as u64;
                assert_eq!(fec_bytes(payload, r), expected);
            }
        }
    }

    #[test]
    fn profile_selection_boundaries() {
        assert_eq!(pick_profile(1).unwrap().name, "DVD+R");
        assert_eq!(pick_profile(2_295_104).unwrap().name, "DVD+R");
        assert_eq!(pick_profile(2_295_105).unwrap().name, "DVD+R DL");
        assert_eq!(pick_profile(48_878_592).unwrap().name, "BD-XL TL");
        assert!(pick_profile(48_878_593).is_none());
    }

    #[test]
    fn scenario_s1_one_mib_zero_file() {
        // 1 MiB of data padded onto the boot area: data_sectors = ceil(1MiB/2048) = 512,
        // but the boot header/body occupy the leading 0x8000 bytes (16 sectors) before the ISO
        // payload proper, so the input ISO (as produced by xorriso with -no-pad) already
        // reserves that area; here we exercise hash_sectors directly against the scenario's
        // documented data_sectors value.
        assert_eq!(hash_sectors(520), 6);
    }

    #[test]
    fn scenario_s2_empty_input() {
        // ceil(0x8000 / 2048) = 16
        assert_eq!(data_sectors(0x8000), 16);
        assert_eq!(hash_sectors(16), 2);
        assert_eq!(pick_profile(16 + 2).unwrap().name, "DVD+R");
    }

    #[test]
    fn geometry_warns_but_still_builds_when_fec_infeasible() {
        // An absurdly large data region: no profile fits, so Geometry::compute must still
        // succeed with r=24 and profile=None rather than erroring out.
        let g = Geometry::compute(48_878_593 * DATA_BLOCK).unwrap();
        assert!(g.profile.is_none());
        assert_eq!(g.selected_fec_roots, MAX_FEC_ROOTS);
    }

    #[test]
    fn format_bytes_is_binary_prefixed() {
        assert!(format_bytes(1024).contains("KiB") || format_bytes(1024).contains("KB"));
    }
}
