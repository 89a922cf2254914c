//! MEMDISK boot disk detection.
//!
//! A MEMDISK loader leaves an `mBFT` table in low memory describing the RAM disk it booted
//! from. Finding that table is how the bus learns about its boot-time memory disk.
//!
//! Table layout (little-endian, packed):
//!
//! | offset | field |
//! |---|---|
//! | 0 | signature `"mBFT"` |
//! | 4 | table length |
//! | 8 | revision |
//! | 9 | checksum (all `length` bytes sum to zero) |
//! | 10 | OEM id / table id / reserved |
//! | 36 | safe hook address |
//! | 40 | MEMDISK patch area |

use thiserror::Error;

use crate::backend::AttachedDisk;
use crate::device::{DeviceRef, DiskKind};

pub const MBFT_SIGNATURE: [u8; 4] = *b"mBFT";

const PATCH_AREA: usize = 40;
/// Bytes up to and including the patch area's drive number.
pub const MBFT_MIN_LEN: usize = PATCH_AREA + 53;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemdiskError {
    #[error("bad mBFT signature")]
    BadSignature,
    #[error("mBFT length {len} outside {min}..={available}")]
    BadLength {
        len: usize,
        min: usize,
        available: usize,
    },
    #[error("mBFT checksum mismatch (sum {sum:#04x})")]
    BadChecksum { sum: u8 },
}

/// Decoded `mBFT` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemdiskTable {
    pub revision: u8,
    pub safe_hook: u32,
    pub version_major: u8,
    pub version_minor: u8,
    /// Physical address of the RAM disk image.
    pub disk_buf: u32,
    /// Size of the RAM disk in 512-byte sectors.
    pub disk_size: u32,
    pub drive_number: u8,
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

impl MemdiskTable {
    /// Decodes a table starting at `bytes[0]`.
    pub fn parse(bytes: &[u8]) -> Result<Self, MemdiskError> {
        if bytes.len() < 8 || bytes[..4] != MBFT_SIGNATURE {
            return Err(MemdiskError::BadSignature);
        }
        let len = u32_at(bytes, 4) as usize;
        if len < MBFT_MIN_LEN || len > bytes.len() {
            return Err(MemdiskError::BadLength {
                len,
                min: MBFT_MIN_LEN,
                available: bytes.len(),
            });
        }
        let sum = bytes[..len].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(MemdiskError::BadChecksum { sum });
        }

        let mdi = &bytes[PATCH_AREA..len];
        Ok(Self {
            revision: bytes[8],
            safe_hook: u32_at(bytes, 36),
            version_minor: mdi[2],
            version_major: mdi[3],
            disk_buf: u32_at(mdi, 4),
            disk_size: u32_at(mdi, 8),
            drive_number: mdi[52],
        })
    }

    /// The boot-time memory disk this table describes.
    pub fn attached_disk(&self) -> AttachedDisk {
        AttachedDisk {
            device: DeviceRef::new(
                format!("memdisk:{:#04x}", self.drive_number),
                DiskKind::Memory {
                    disk_buf: self.disk_buf,
                    sectors: self.disk_size,
                },
            ),
            boot: true,
        }
    }
}

/// Scans `memory` (which starts at physical address `base`) on 16-byte boundaries for a valid
/// `mBFT` table. Returns its physical address and contents.
pub fn probe(memory: &[u8], base: u32) -> Option<(u32, MemdiskTable)> {
    let start = (16 - (base as usize % 16)) % 16;
    (start..memory.len())
        .step_by(16)
        .filter(|&off| memory[off..].starts_with(&MBFT_SIGNATURE))
        .find_map(|off| match MemdiskTable::parse(&memory[off..]) {
            Ok(table) => Some((base.wrapping_add(off as u32), table)),
            Err(err) => {
                tracing::debug!(offset = off, %err, "ignoring mBFT candidate");
                None
            }
        })
}

#[cfg(test)]
pub(crate) fn build_table(disk_buf: u32, disk_size: u32, drive_number: u8) -> Vec<u8> {
    let mut table = vec![0u8; MBFT_MIN_LEN];
    table[..4].copy_from_slice(&MBFT_SIGNATURE);
    table[4..8].copy_from_slice(&(MBFT_MIN_LEN as u32).to_le_bytes());
    table[8] = 1;
    table[PATCH_AREA..PATCH_AREA + 2].copy_from_slice(&26u16.to_le_bytes());
    table[PATCH_AREA + 2] = 74;
    table[PATCH_AREA + 3] = 3;
    table[PATCH_AREA + 4..PATCH_AREA + 8].copy_from_slice(&disk_buf.to_le_bytes());
    table[PATCH_AREA + 8..PATCH_AREA + 12].copy_from_slice(&disk_size.to_le_bytes());
    table[PATCH_AREA + 52] = drive_number;
    let sum = table.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    table[9] = 0u8.wrapping_sub(sum);
    table
}
