use crate::error::{CacheError, Result};
use crate::perms::harden_file;
use crate::util::{atomic_write, bincode_deserialize, bincode_serialize};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

pub const INDEX_FILENAME: &str = "index";
pub const INDEX_RECORD_LEN: usize = 12;

/// Version and cumulative stored bytes of one cache root.
///
/// Encoded as `u32` version followed by `u64` size, host byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    pub size_bytes: u64,
}

impl CacheIndex {
    pub fn new(version: u32, size_bytes: u64) -> Self {
        Self {
            version,
            size_bytes,
        }
    }

    /// Read the index at `path`.
    ///
    /// `Ok(None)` means the file does not exist. A file of the wrong length or
    /// that fails to decode is [`CacheError::IndexCorrupt`]; callers treat both as
    /// an empty version-0 index.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CacheError::IndexCorrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })
            }
        };

        if bytes.len() != INDEX_RECORD_LEN {
            return Err(CacheError::IndexCorrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "expected {INDEX_RECORD_LEN} bytes, found {}",
                    bytes.len()
                ),
            });
        }

        bincode_deserialize(&bytes)
            .map(Some)
            .map_err(|err| CacheError::IndexCorrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    /// Replace the index at `path` with this record.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode_serialize(self)?;
        atomic_write(path, &bytes)?;
        harden_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_index_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(CacheIndex::load(&tmp.path().join(INDEX_FILENAME)).unwrap(), None);
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INDEX_FILENAME);
        let index = CacheIndex::new(7, 123_456_789_012);

        index.save(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), INDEX_RECORD_LEN as u64);
        assert_eq!(CacheIndex::load(&path).unwrap(), Some(index));
    }

    #[test]
    fn record_layout_is_version_then_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INDEX_FILENAME);
        CacheIndex::new(2, 4096).save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &2u32.to_ne_bytes());
        assert_eq!(&bytes[4..], &4096u64.to_ne_bytes());
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INDEX_FILENAME);
        std::fs::write(&path, b"short").unwrap();

        let err = CacheIndex::load(&path).unwrap_err();
        assert!(matches!(err, CacheError::IndexCorrupt { .. }), "{err:?}");
    }
}
