use crate::cache_dir::{create_shard_tree, CacheConfig};
use crate::diagnostics::DiagnosticsLog;
use crate::entry::{load_entry, store_entry, EntryRequest};
use crate::error::{CacheError, Result};
use crate::evict::{check_index, wipe_shards, WipeReason, WipeReport};
use crate::fingerprint::{Fingerprint, Fragment};
use crate::index::{CacheIndex, INDEX_FILENAME};
use crate::lock::LockedFile;
use crate::path::entry_path;
use crate::perms::create_private_dir_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock file serializing index rewrites and wipes across processes.
pub const ROOT_LOCK_FILENAME: &str = "index.lock";

/// Point-in-time counters for one [`KernelCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries found at the right path that answered a different request, or
    /// were unreadable. Also counted in `misses`.
    pub collisions: u64,
    pub stores: u64,
    pub store_failures: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

/// Persistent cache of compiled kernel binaries for one device class.
///
/// Entries are addressed by a [`Fingerprint`] of the source fragments and build
/// options, and every hit is verified byte-for-byte against the request, so a
/// fingerprint collision or a foreign file can only produce a miss.
///
/// The filesystem is the source of truth. Several `KernelCache` values (in one
/// process or many) may share a root; the in-memory [`CacheIndex`] is only a
/// snapshot of what this instance last read or wrote.
#[derive(Debug)]
pub struct KernelCache {
    root: PathBuf,
    format_version: u32,
    size_budget: u64,
    report_lookups: bool,
    index: CacheIndex,
    initial_wipe: Option<WipeReport>,
    diagnostics: DiagnosticsLog,
    stats: StatCounters,
}

impl KernelCache {
    /// Open (creating if needed) the cache root for `device_class`.
    ///
    /// If the stored index names a different `format_version`, or records more
    /// than `size_budget` bytes, every entry is deleted and the index is reset to
    /// `(format_version, 0)`.
    pub fn init(
        config: &CacheConfig,
        device_class: &str,
        format_version: u32,
        size_budget: u64,
    ) -> Result<Self> {
        let root = config.device_root(device_class)?;
        create_shard_tree(&root)?;
        let diagnostics = DiagnosticsLog::new(&root);

        let (index, initial_wipe) =
            match validate_root(&root, format_version, size_budget, &diagnostics) {
                Ok(validated) => validated,
                Err(err) => {
                    diagnostics.record(format_args!("init failed: {err}"));
                    return Err(err);
                }
            };

        tracing::debug!(
            target: "kiln.cache",
            root = %root.display(),
            version = index.version,
            size_bytes = index.size_bytes,
            wiped = initial_wipe.is_some(),
            "opened kernel cache"
        );

        Ok(Self {
            root,
            format_version,
            size_budget,
            report_lookups: config.report_lookups,
            index,
            initial_wipe,
            diagnostics,
            stats: StatCounters::default(),
        })
    }

    /// [`KernelCache::init`] with configuration read from the environment.
    pub fn init_from_env(device_class: &str, format_version: u32, size_budget: u64) -> Result<Self> {
        let config = CacheConfig::from_env()?;
        Self::init(&config, device_class, format_version, size_budget)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn size_budget(&self) -> u64 {
        self.size_budget
    }

    /// The index as this instance last read or wrote it.
    pub fn index(&self) -> CacheIndex {
        self.index
    }

    /// What `init` deleted, if it had to wipe the root.
    pub fn initial_wipe(&self) -> Option<WipeReport> {
        self.initial_wipe
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn diagnostics_log(&self) -> &Path {
        self.diagnostics.path()
    }

    /// Where the entry for this request lives (whether or not it exists).
    pub fn entry_path(&self, fragments: &[Fragment<'_>], options: &str) -> PathBuf {
        entry_path(&self.root, &Fingerprint::of(fragments, options))
    }

    /// Return the payload stored for `fragments` + `options`, if any.
    ///
    /// Entries that exist but answer a different request (or are truncated or
    /// otherwise malformed) are logged and reported as a miss. Only real I/O
    /// failures are returned as errors.
    pub fn lookup(&self, fragments: &[Fragment<'_>], options: &str) -> Result<Option<Vec<u8>>> {
        let fingerprint = Fingerprint::of(fragments, options);
        let path = entry_path(&self.root, &fingerprint);
        let request = self.request(fragments, options);

        let found = match load_entry(&path, &request) {
            Ok(found) => found,
            Err(err) if err.is_miss() => {
                StatCounters::bump(&self.stats.collisions);
                self.diagnostics
                    .record(format_args!("lookup {fingerprint} rejected entry: {err}"));
                None
            }
            Err(err) => {
                self.diagnostics
                    .record(format_args!("lookup {fingerprint} failed: {err}"));
                return Err(err);
            }
        };

        if found.is_some() {
            StatCounters::bump(&self.stats.hits);
            tracing::debug!(target: "kiln.cache", %fingerprint, "cache hit");
        } else {
            StatCounters::bump(&self.stats.misses);
            tracing::debug!(target: "kiln.cache", %fingerprint, "cache miss");
        }
        if self.report_lookups {
            let outcome = if found.is_some() { "hit" } else { "miss" };
            println!("kiln-cache: {outcome} {fingerprint}");
        }
        Ok(found)
    }

    /// Persist `payload` as the answer for `fragments` + `options`.
    ///
    /// A failed write leaves no file behind. If the entry was written but the
    /// index could not be updated the error is still returned; the entry stays
    /// valid and will be found by later lookups.
    pub fn store(&mut self, fragments: &[Fragment<'_>], options: &str, payload: &[u8]) -> Result<()> {
        let fingerprint = Fingerprint::of(fragments, options);
        let path = entry_path(&self.root, &fingerprint);

        match self.store_at(&path, fragments, options, payload) {
            Ok(written) => {
                StatCounters::bump(&self.stats.stores);
                tracing::debug!(
                    target: "kiln.cache",
                    %fingerprint,
                    bytes = written,
                    total_bytes = self.index.size_bytes,
                    "stored kernel binary"
                );
                Ok(())
            }
            Err(err) => {
                StatCounters::bump(&self.stats.store_failures);
                self.diagnostics
                    .record(format_args!("store {fingerprint} failed: {err}"));
                Err(err)
            }
        }
    }

    /// Delete every entry and reset the index to `(format_version, 0)`.
    pub fn wipe(&mut self) -> Result<WipeReport> {
        let result = (|| {
            let _root_lock = lock_root(&self.root)?;
            reset_root(&self.root, self.format_version, WipeReason::Requested)
        })();
        match result {
            Ok((index, report)) => {
                self.index = index;
                Ok(report)
            }
            Err(err) => {
                self.diagnostics.record(format_args!("wipe failed: {err}"));
                Err(err)
            }
        }
    }

    fn request<'a>(&self, fragments: &'a [Fragment<'a>], options: &'a str) -> EntryRequest<'a> {
        EntryRequest {
            format_version: self.format_version,
            fragments,
            options,
        }
    }

    fn store_at(
        &mut self,
        path: &Path,
        fragments: &[Fragment<'_>],
        options: &str,
        payload: &[u8],
    ) -> Result<u64> {
        if let Some(shard) = path.parent() {
            if !shard.is_dir() {
                create_private_dir_all(shard)?;
            }
        }

        // The entry lock is released inside `store_entry`; the root lock must
        // never be taken while an entry lock is held.
        let written = store_entry(path, &self.request(fragments, options), payload)?;
        self.account(written)?;
        Ok(written)
    }

    /// Add `written` bytes to the on-disk index under the root lock.
    fn account(&mut self, written: u64) -> Result<()> {
        let _root_lock = lock_root(&self.root)?;
        let index_path = self.root.join(INDEX_FILENAME);

        let base = match CacheIndex::load(&index_path) {
            Ok(Some(on_disk)) if on_disk.version == self.format_version => on_disk.size_bytes,
            Ok(Some(on_disk)) => {
                // Another instance re-initialized the root for a different
                // version; our entry is already unreachable for it.
                tracing::debug!(
                    target: "kiln.cache",
                    on_disk = on_disk.version,
                    ours = self.format_version,
                    "cache index belongs to another version; leaving it alone"
                );
                self.index.size_bytes = self.index.size_bytes.saturating_add(written);
                return Ok(());
            }
            Ok(None) => self.index.size_bytes,
            Err(err @ CacheError::IndexCorrupt { .. }) => {
                self.diagnostics
                    .record(format_args!("rebuilding unreadable index: {err}"));
                self.index.size_bytes
            }
            Err(err) => return Err(err),
        };

        let updated = CacheIndex::new(self.format_version, base.saturating_add(written));
        updated.save(&index_path)?;
        self.index = updated;
        Ok(())
    }
}

fn lock_root(root: &Path) -> Result<LockedFile> {
    LockedFile::open_exclusive(&root.join(ROOT_LOCK_FILENAME))
}

/// Load the index under the root lock and wipe the root if it is stale or over
/// budget. A missing or unreadable index counts as `(0, 0)` and is rewritten.
fn validate_root(
    root: &Path,
    format_version: u32,
    size_budget: u64,
    diagnostics: &DiagnosticsLog,
) -> Result<(CacheIndex, Option<WipeReport>)> {
    let _root_lock = lock_root(root)?;
    let index_path = root.join(INDEX_FILENAME);

    let (stored, needs_write) = match CacheIndex::load(&index_path) {
        Ok(Some(stored)) => (stored, false),
        Ok(None) => (CacheIndex::default(), true),
        Err(err @ CacheError::IndexCorrupt { .. }) => {
            diagnostics.record(format_args!("treating unreadable index as empty: {err}"));
            (CacheIndex::default(), true)
        }
        Err(err) => return Err(err),
    };

    match check_index(&stored, format_version, size_budget) {
        Some(reason) => {
            let (index, report) = reset_root(root, format_version, reason)?;
            Ok((index, Some(report)))
        }
        None => {
            if needs_write {
                stored.save(&index_path)?;
            }
            Ok((stored, None))
        }
    }
}

/// Wipe the shard tree, recreate it empty and write a fresh index. The caller
/// holds the root lock.
fn reset_root(
    root: &Path,
    format_version: u32,
    reason: WipeReason,
) -> Result<(CacheIndex, WipeReport)> {
    let report = wipe_shards(root)?;
    create_shard_tree(root)?;
    let index = CacheIndex::new(format_version, 0);
    index.save(&root.join(INDEX_FILENAME))?;

    tracing::info!(
        target: "kiln.cache",
        root = %root.display(),
        %reason,
        removed_files = report.removed_files,
        removed_dirs = report.removed_dirs,
        "wiped kernel cache"
    );
    Ok((index, report))
}
