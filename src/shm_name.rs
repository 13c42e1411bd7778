// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory segment naming.
// A segment is keyed by a filesystem path (the way `ftok` keys SysV IPC);
// the path is hashed into a short POSIX shm name so every process that
// agrees on the path agrees on the segment.

use std::path::Path;

/// Prefix of every hashed segment name.
pub const SHM_PREFIX: &str = "sdtp";

/// Longest accepted name, leading '/' included (`PSHMNAMLEN` on macOS).
pub const SHM_NAME_MAX: usize = if cfg!(target_os = "macos") { 31 } else { 255 };

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, 64 bit.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

/// OS-level name for `name`: a leading '/' is added when missing, and names
/// too long for the platform collapse to their hash.
pub fn make_shm_name(name: &str) -> String {
    let slashed = match name.strip_prefix('/') {
        Some(_) => name.to_owned(),
        None => format!("/{name}"),
    };
    if slashed.len() > SHM_NAME_MAX {
        return hashed(slashed.as_bytes());
    }
    slashed
}

/// Segment name for a key path: `/sdtp_<16 hex digits>`.
///
/// The path is used verbatim (not canonicalised) so producer and consumer
/// only need to agree on the string, not on whether the file exists.
pub fn key_name(path: &Path) -> String {
    hashed(path.as_os_str().as_encoded_bytes())
}

fn hashed(bytes: &[u8]) -> String {
    format!("/{SHM_PREFIX}_{:016x}", fnv1a_64(bytes))
}
