use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the kernel binary cache.
///
/// Lookups never surface [`CacheError::FormatMismatch`] or
/// [`CacheError::CorruptEntry`] to callers: the facade turns both into a miss
/// (see [`CacheError::is_miss`]). Everything else means the cache could not do
/// its job and the caller should compile without it.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("invalid device class {label:?}: must be a single path component")]
    InvalidDeviceClass { label: String },

    #[error("invalid value for {var}: {message}")]
    InvalidConfig { var: &'static str, message: String },

    #[error("unsupported cache request: {reason}")]
    UnsupportedRequest { reason: String },

    #[error("io error while {context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry {path} does not match the request: {reason}")]
    FormatMismatch { path: PathBuf, reason: String },

    #[error("cache entry {path} is corrupt: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    #[error("failed to restrict permissions on {path}: {source}")]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache index {path} is unreadable: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    #[error("failed to wipe cache contents at {path}: {source}")]
    WipeFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl CacheError {
    pub(crate) fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn mismatch(path: &Path, reason: impl Into<String>) -> Self {
        Self::FormatMismatch {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that describe an unusable entry rather than a
    /// failing cache. These degrade to a miss so the caller recompiles.
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            Self::FormatMismatch { .. } | Self::CorruptEntry { .. }
        )
    }
}

impl From<walkdir::Error> for CacheError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(Path::to_path_buf).unwrap_or_default();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
        Self::WipeFailure { path, source }
    }
}
