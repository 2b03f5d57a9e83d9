use crate::error::{CacheError, Result};
use crate::index::CacheIndex;
use crate::path::top_level_shards;
use std::fmt;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Why a cache root had to be wiped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WipeReason {
    VersionChanged { stored: u32, expected: u32 },
    OverBudget { size_bytes: u64, budget_bytes: u64 },
    Requested,
}

impl fmt::Display for WipeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionChanged { stored, expected } => {
                write!(f, "cache version {stored} does not match expected {expected}")
            }
            Self::OverBudget {
                size_bytes,
                budget_bytes,
            } => write!(
                f,
                "cache holds {size_bytes} bytes, over the {budget_bytes} byte budget"
            ),
            Self::Requested => f.write_str("wipe requested"),
        }
    }
}

/// Counts from one wipe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WipeReport {
    pub removed_files: u64,
    pub removed_dirs: u64,
}

impl WipeReport {
    fn merge(&mut self, other: WipeReport) {
        self.removed_files += other.removed_files;
        self.removed_dirs += other.removed_dirs;
    }
}

/// Decide whether the stored index still describes a usable cache.
///
/// There is no partial eviction: a version change or a cumulative size above the
/// budget invalidates the whole root.
pub fn check_index(
    stored: &CacheIndex,
    expected_version: u32,
    size_budget: u64,
) -> Option<WipeReason> {
    if stored.version != expected_version {
        return Some(WipeReason::VersionChanged {
            stored: stored.version,
            expected: expected_version,
        });
    }
    if stored.size_bytes > size_budget {
        return Some(WipeReason::OverBudget {
            size_bytes: stored.size_bytes,
            budget_bytes: size_budget,
        });
    }
    None
}

/// Delete every shard directory under `root` and everything inside it.
///
/// Files outside the shard tree (the index, the diagnostics log) are left alone.
/// The caller recreates the shard tree afterwards.
pub(crate) fn wipe_shards(root: &Path) -> Result<WipeReport> {
    let mut report = WipeReport::default();
    for shard in top_level_shards(root) {
        report.merge(remove_tree(&shard)?);
    }
    Ok(report)
}

fn remove_tree(dir: &Path) -> Result<WipeReport> {
    let mut report = WipeReport::default();
    match std::fs::symlink_metadata(dir) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(source) => {
            return Err(CacheError::WipeFailure {
                path: dir.to_path_buf(),
                source,
            })
        }
    }

    for entry in WalkDir::new(dir).follow_links(false).contents_first(true) {
        let entry = entry?;
        let path = entry.path();
        let removed = if entry.file_type().is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        match removed {
            Ok(()) if entry.file_type().is_dir() => report.removed_dirs += 1,
            Ok(()) => report.removed_files += 1,
            // Another process may be wiping the same root.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CacheError::WipeFailure {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    Ok(report)
}
