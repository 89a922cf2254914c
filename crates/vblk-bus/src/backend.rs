//! Attach entry points of the disk backends.
//!
//! The data path of each backend lives elsewhere; the bus only needs a device identity to link
//! into its registry.

use std::path::PathBuf;
use std::sync::Arc;

use crate::device::{DeviceRef, DiskKind};
use crate::error::{BusError, Result};

/// A disk produced by a backend, ready to be linked onto the bus.
#[derive(Debug)]
pub struct AttachedDisk {
    pub device: DeviceRef,
    pub boot: bool,
}

/// Backend reached through an attach control request.
pub trait AttachBackend: Send + Sync {
    /// Creates a disk from the raw control-request input buffer.
    fn attach(&self, input: &[u8]) -> Result<AttachedDisk>;
}

/// The backends reachable through control requests.
#[derive(Clone)]
pub struct Backends {
    pub file: Arc<dyn AttachBackend>,
    pub dummy: Arc<dyn AttachBackend>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            file: Arc::new(FileBackend),
            dummy: Arc::new(DummyBackend),
        }
    }
}

/// File-backed disks. Input: UTF-8 path of an existing regular file, optionally NUL terminated.
#[derive(Debug, Default)]
pub struct FileBackend;

impl AttachBackend for FileBackend {
    fn attach(&self, input: &[u8]) -> Result<AttachedDisk> {
        let end = input.iter().position(|&b| b == 0).unwrap_or(input.len());
        let path = std::str::from_utf8(&input[..end])
            .map_err(|_| BusError::Backend("file path is not valid UTF-8".to_string()))?;
        if path.is_empty() {
            return Err(BusError::InvalidBuffer {
                needed: 1,
                got: 0,
            });
        }

        let path = PathBuf::from(path);
        let meta = std::fs::metadata(&path)
            .map_err(|err| BusError::Backend(format!("{}: {err}", path.display())))?;
        if !meta.is_file() {
            return Err(BusError::Backend(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = format!("file:{}", path.display());
        Ok(AttachedDisk {
            device: DeviceRef::new(
                name,
                DiskKind::File {
                    path,
                    size_bytes: meta.len(),
                },
            ),
            boot: false,
        })
    }
}

/// Size-only placeholder disks. Input: little-endian `u64` size in bytes.
#[derive(Debug, Default)]
pub struct DummyBackend;

impl AttachBackend for DummyBackend {
    fn attach(&self, input: &[u8]) -> Result<AttachedDisk> {
        let Some(bytes) = input.get(..8) else {
            return Err(BusError::InvalidBuffer {
                needed: 8,
                got: input.len(),
            });
        };
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        let size_bytes = u64::from_le_bytes(raw);
        Ok(AttachedDisk {
            device: DeviceRef::new("dummy", DiskKind::Dummy { size_bytes }),
            boot: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dummy_reads_little_endian_size() {
        let disk = DummyBackend.attach(&4096u64.to_le_bytes()).unwrap();
        assert_eq!(*disk.device.kind(), DiskKind::Dummy { size_bytes: 4096 });
        assert!(!disk.boot);
    }

    #[test]
    fn dummy_rejects_short_input() {
        let err = DummyBackend.attach(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, BusError::InvalidBuffer { needed: 8, got: 3 }));
    }

    #[test]
    fn file_backend_uses_file_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 1024]).unwrap();
        let mut input = file.path().to_str().unwrap().as_bytes().to_vec();
        input.push(0);

        let disk = FileBackend.attach(&input).unwrap();
        match disk.device.kind() {
            DiskKind::File { path, size_bytes } => {
                assert_eq!(path, file.path());
                assert_eq!(*size_bytes, 1024);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn file_backend_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.img");
        let err = FileBackend
            .attach(missing.to_str().unwrap().as_bytes())
            .unwrap_err();
        assert!(matches!(err, BusError::Backend(_)));
    }
}
