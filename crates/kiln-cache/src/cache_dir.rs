use crate::error::{CacheError, Result};
use crate::path::leaf_shards;
use crate::perms::create_private_dir_all;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";
pub const REPORT_LOOKUPS_ENV: &str = "KILN_CACHE_REPORT";

/// Configuration for selecting the on-disk cache root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Override the base cache directory (the device class is still appended).
    pub cache_root_override: Option<PathBuf>,
    /// Print `hit`/`miss` for every lookup to stdout, for external test harnesses.
    pub report_lookups: bool,
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self> {
        let cache_root_override = lookup(CACHE_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let report_lookups = match lookup(REPORT_LOOKUPS_ENV) {
            None => false,
            Some(raw) => parse_flag(REPORT_LOOKUPS_ENV, &raw)?,
        };

        Ok(Self {
            cache_root_override,
            report_lookups,
        })
    }

    /// The base directory device-class roots live under.
    pub fn base_dir(&self) -> Result<PathBuf> {
        match &self.cache_root_override {
            Some(root) => Ok(root.clone()),
            None => default_cache_root(),
        }
    }

    /// `<base>/<device_class>`, without touching the filesystem.
    pub fn device_root(&self, device_class: &str) -> Result<PathBuf> {
        validate_device_class(device_class)?;
        Ok(self.base_dir()?.join(device_class))
    }
}

fn parse_flag(var: &'static str, raw: &std::ffi::OsStr) -> Result<bool> {
    let value = raw.to_string_lossy();
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        other => Err(CacheError::InvalidConfig {
            var,
            message: format!("expected a boolean flag, found {other:?}"),
        }),
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".kiln").join("cache"))
}

/// A device class names exactly one directory under the base.
fn validate_device_class(label: &str) -> Result<()> {
    let mut components = Path::new(label).components();
    let valid = !label.contains('\0')
        && !label.contains(['/', '\\'])
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidDeviceClass {
            label: label.to_owned(),
        })
    }
}

/// Create `root` and its full 16x16 shard tree, owner-only. Idempotent.
pub(crate) fn create_shard_tree(root: &Path) -> Result<()> {
    create_private_dir_all(root)?;
    for leaf in leaf_shards(root) {
        create_private_dir_all(&leaf)?;
    }
    Ok(())
}
