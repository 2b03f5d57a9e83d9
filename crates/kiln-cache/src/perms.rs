//! Owner-only access for cache files and directories.
//!
//! Cached binaries are executable code for the user's devices, so nothing under
//! the cache root should be readable or writable by other users. On non-Unix
//! targets these helpers only create directories.

use crate::error::{CacheError, Result};
use std::path::Path;

#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const PRIVATE_FILE_MODE: u32 = 0o600;

/// `create_dir_all` with owner-only mode on every newly created component, then
/// an explicit chmod of `path` itself in case it already existed.
pub(crate) fn create_private_dir_all(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(PRIVATE_DIR_MODE);
    }
    builder
        .create(path)
        .map_err(|err| CacheError::io("creating directory", path, err))?;
    harden_dir(path)
}

#[cfg(unix)]
pub(crate) fn harden_dir(path: &Path) -> Result<()> {
    set_mode(path, PRIVATE_DIR_MODE)
}

#[cfg(unix)]
pub(crate) fn harden_file(path: &Path) -> Result<()> {
    set_mode(path, PRIVATE_FILE_MODE)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        CacheError::Permission {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// [`harden_file`] through an already open handle, so it applies even if the
/// path has since been unlinked.
#[cfg(unix)]
pub(crate) fn harden_open_file(file: &std::fs::File, path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(std::fs::Permissions::from_mode(PRIVATE_FILE_MODE))
        .map_err(|source| CacheError::Permission {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
pub(crate) fn harden_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn harden_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn harden_open_file(_file: &std::fs::File, _path: &Path) -> Result<()> {
    Ok(())
}

/// Open options for a cache file that is created owner-only from the start.
pub(crate) fn private_open_options() -> std::fs::OpenOptions {
    #[allow(unused_mut)]
    let mut options = std::fs::OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }
    options
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn created_directories_are_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("gfx90a").join("a");
        create_private_dir_all(&dir).unwrap();
        assert_eq!(mode_of(&dir), 0o700);
        assert_eq!(mode_of(&tmp.path().join("gfx90a")), 0o700);
    }

    #[test]
    fn existing_directory_is_tightened() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("open");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).unwrap();

        create_private_dir_all(&dir).unwrap();
        assert_eq!(mode_of(&dir), 0o700);
    }

    #[test]
    fn harden_file_drops_group_and_other_bits() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("entry");
        std::fs::write(&file, b"bytes").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o666)).unwrap();

        harden_file(&file).unwrap();
        assert_eq!(mode_of(&file), 0o600);
    }

    #[test]
    fn harden_missing_file_is_a_permission_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = harden_file(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, CacheError::Permission { .. }), "{err:?}");
    }
}
