use crate::fingerprint::Fingerprint;
use std::path::{Path, PathBuf};

/// Number of directories at each of the two shard levels.
pub const SHARD_FANOUT: usize = 16;

const HEX_DIGITS: &[u8; SHARD_FANOUT] = b"0123456789abcdef";

/// Maps `fingerprint` to `<root>/<hex[0]>/<hex[1]>/<hex[2..]>`.
pub fn entry_path(root: &Path, fingerprint: &Fingerprint) -> PathBuf {
    let hex = fingerprint.to_hex();
    root.join(&hex[..1]).join(&hex[1..2]).join(&hex[2..])
}

/// The sixteen first-level shard directories under `root`.
pub fn top_level_shards(root: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    HEX_DIGITS
        .iter()
        .map(move |&digit| root.join(char::from(digit).to_string()))
}

/// Every leaf shard directory (`16 * 16` of them) under `root`.
pub fn leaf_shards(root: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    top_level_shards(root).flat_map(|top| {
        HEX_DIGITS
            .iter()
            .map(move |&digit| top.join(char::from(digit).to_string()))
    })
}
