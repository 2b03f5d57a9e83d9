use crate::error::{CacheError, Result};
use crate::perms::{harden_open_file, private_open_options};
use fs2::FileExt;
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

const LOCK_STRIPES: usize = 64;
const MAX_REOPEN_ATTEMPTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// An open cache file held under an OS advisory lock for as long as the value lives.
///
/// `fs2` locks coordinate processes; they are not guaranteed to exclude other
/// threads of the same process on every platform. Each lock therefore also holds
/// an in-process reader/writer guard striped by path, so threads see the same
/// shared/exclusive semantics as separate processes.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    mode: LockMode,
    _guard: StripeGuard,
}

#[derive(Debug)]
enum StripeGuard {
    Shared(#[allow(dead_code)] RwLockReadGuard<'static, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'static, ()>),
}

impl LockedFile {
    /// Open an existing file for reading under a shared lock.
    ///
    /// Returns `Ok(None)` when the file does not exist. Blocks while a writer
    /// holds the exclusive lock.
    pub fn open_shared(path: &Path) -> Result<Option<Self>> {
        let guard = StripeGuard::shared(path);
        for _ in 0..MAX_REOPEN_ATTEMPTS {
            let file = match File::open(path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(CacheError::io("opening", path, err)),
            };
            FileExt::lock_shared(&file)
                .map_err(|err| CacheError::io("taking shared lock on", path, err))?;

            if is_current(&file, path)? {
                return Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                    mode: LockMode::Shared,
                    _guard: guard,
                }));
            }
            let _ = FileExt::unlock(&file);
        }
        Err(replaced_too_often(path))
    }

    /// Open (creating if needed) `path` for writing under an exclusive lock.
    ///
    /// The file is never truncated here: a reader may still hold a shared lock on
    /// the old contents. Call [`LockedFile::truncate`] once the lock is held.
    ///
    /// If the file was removed or replaced while this call waited for the lock,
    /// the stale handle is dropped and the current file is opened instead.
    pub fn open_exclusive(path: &Path) -> Result<Self> {
        let guard = StripeGuard::exclusive(path);
        for _ in 0..MAX_REOPEN_ATTEMPTS {
            let file = private_open_options()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)
                .map_err(|err| CacheError::io("opening", path, err))?;
            FileExt::lock_exclusive(&file)
                .map_err(|err| CacheError::io("taking exclusive lock on", path, err))?;

            if is_current(&file, path)? {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                    mode: LockMode::Exclusive,
                    _guard: guard,
                });
            }
            tracing::debug!(
                target: "kiln.cache",
                path = %path.display(),
                "cache file replaced while waiting for its lock; reopening"
            );
            let _ = FileExt::unlock(&file);
        }
        Err(replaced_too_often(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Current on-disk length of the locked file.
    pub fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| CacheError::io("reading metadata of", &self.path, err))
    }

    pub fn truncate(&mut self) -> Result<()> {
        debug_assert_eq!(self.mode, LockMode::Exclusive);
        self.file
            .set_len(0)
            .map_err(|err| CacheError::io("truncating", &self.path, err))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|err| CacheError::io("syncing", &self.path, err))
    }

    /// Restrict the locked file to its owner through the open handle.
    pub fn harden(&self) -> Result<()> {
        harden_open_file(&self.file, &self.path)
    }
}

/// Whether `file` is still the file linked at `path`.
fn is_current(file: &File, path: &Path) -> Result<bool> {
    let linked = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(CacheError::io("reading metadata of", path, err)),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let held = file
            .metadata()
            .map_err(|err| CacheError::io("reading metadata of", path, err))?;
        Ok(held.dev() == linked.dev() && held.ino() == linked.ino())
    }
    #[cfg(not(unix))]
    {
        // Open files cannot be unlinked here, so existence is enough.
        let _ = (file, linked);
        Ok(true)
    }
}

fn replaced_too_often(path: &Path) -> CacheError {
    CacheError::io(
        "locking",
        path,
        io::Error::other("file kept being replaced while waiting for its lock"),
    )
}

impl Read for LockedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LockedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // `_guard` drops after this body, so the OS lock is released first.
        let _ = FileExt::unlock(&self.file);
    }
}

impl StripeGuard {
    fn shared(path: &Path) -> Self {
        let stripe = stripe_for_path(path);
        Self::Shared(
            stripe
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn exclusive(path: &Path) -> Self {
        let stripe = stripe_for_path(path);
        Self::Exclusive(
            stripe
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

fn stripe_for_path(path: &Path) -> &'static RwLock<()> {
    static STRIPES: OnceLock<Vec<RwLock<()>>> = OnceLock::new();
    let stripes = STRIPES.get_or_init(|| (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect());

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    &stripes[(hasher.finish() as usize) % LOCK_STRIPES]
}
