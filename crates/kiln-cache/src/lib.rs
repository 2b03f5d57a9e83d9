//! Persistent, content-addressed cache for compiled kernel binaries.
//!
//! A request is an ordered list of source [`Fragment`]s plus a build-options
//! string. [`KernelCache::store`] persists the binary produced for a request and
//! [`KernelCache::lookup`] returns it on a later run, after checking every byte
//! of the stored request against the new one. Anything that does not match
//! exactly (a fingerprint collision, an entry from another format version or
//! word size, a truncated file) is a miss, so the caller simply recompiles.
//!
//! The cache is all-or-nothing: a changed format version, or a cumulative size
//! over the configured budget, wipes the whole root on the next
//! [`KernelCache::init`]. There is no per-entry eviction.
//!
//! ## On-disk layout (inventory)
//!
//! Each device class gets its own root, `<base>/<device_class>/`, where `<base>`
//! is `$KILN_CACHE_DIR` or `~/.kiln/cache`:
//! - `<h0>/<h1>/<h2..h31>`:
//!   - one entry per [`Fingerprint`], sharded by its first two hex digits into a
//!     fixed 16x16 tree; format described in the `entry` module docs
//! - `index`:
//!   - [`CacheIndex`] (format version + cumulative stored bytes), 12 bytes,
//!     replaced atomically
//! - `index.lock`:
//!   - held exclusively while the index is rewritten or the root is wiped
//! - `cache-error.log`:
//!   - [`DiagnosticsLog`], timestamped failure lines, best effort
//!
//! Files are created owner-only (`0600`, directories `0700`) on Unix.

mod cache;
mod cache_dir;
mod diagnostics;
mod entry;
mod error;
mod evict;
mod fingerprint;
mod index;
mod lock;
mod path;
mod perms;
mod util;

pub use cache::{CacheStats, KernelCache, ROOT_LOCK_FILENAME};
pub use cache_dir::{CacheConfig, CACHE_DIR_ENV, REPORT_LOOKUPS_ENV};
pub use diagnostics::{DiagnosticsLog, DIAGNOSTICS_LOG_FILENAME};
pub use entry::{entry_len, EntryHeader, EntryRequest, ENTRY_HEADER_LEN, ENTRY_MAGIC};
pub use error::{CacheError, Result};
pub use evict::{check_index, WipeReason, WipeReport};
pub use fingerprint::{Fingerprint, Fragment};
pub use index::{CacheIndex, INDEX_FILENAME, INDEX_RECORD_LEN};
pub use lock::{LockMode, LockedFile};
pub use path::{entry_path, leaf_shards, top_level_shards, SHARD_FANOUT};
