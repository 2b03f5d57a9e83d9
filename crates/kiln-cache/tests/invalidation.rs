use kiln_cache::{
    entry_len, CacheConfig, CacheIndex, EntryHeader, Fragment, KernelCache, WipeReport,
    ENTRY_HEADER_LEN, INDEX_FILENAME,
};
use std::path::Path;

fn config(base: &Path) -> CacheConfig {
    CacheConfig {
        cache_root_override: Some(base.to_path_buf()),
        report_lookups: false,
    }
}

#[test]
fn new_format_version_empties_the_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let fragments = [Fragment::labeled("kernelA.cl", b"__kernel void k(){}")];

    let mut old = KernelCache::init(&config(tmp.path()), "gfx90a", 1, 1 << 20).unwrap();
    old.store(&fragments, "-O2", b"BINARY1").unwrap();
    let stale_path = old.entry_path(&fragments, "-O2");
    drop(old);

    let new = KernelCache::init(&config(tmp.path()), "gfx90a", 2, 1 << 20).unwrap();
    let report = new.initial_wipe().unwrap();
    assert_eq!(report.removed_files, 1);
    assert!(!stale_path.exists());
    assert_eq!(new.lookup(&fragments, "-O2").unwrap(), None);
    assert_eq!(new.index(), CacheIndex::new(2, 0));
    assert_eq!(
        CacheIndex::load(&new.root().join(INDEX_FILENAME)).unwrap(),
        Some(CacheIndex::new(2, 0))
    );
}

#[test]
fn exceeding_the_budget_wipes_on_next_init() {
    let tmp = tempfile::tempdir().unwrap();
    let budget = 256;
    let payload = vec![0xAB; 200];
    let a = [Fragment::from("kernel a")];
    let b = [Fragment::from("kernel b")];

    let mut cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, budget).unwrap();
    cache.store(&a, "", &payload).unwrap();
    // Over budget already, but stores are never refused.
    cache.store(&b, "", &payload).unwrap();
    assert_eq!(
        cache.index().size_bytes,
        entry_len(&a, "", &payload) + entry_len(&b, "", &payload)
    );
    assert!(cache.lookup(&b, "").unwrap().is_some());
    drop(cache);

    let cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, budget).unwrap();
    assert_eq!(cache.initial_wipe().map(|r| r.removed_files), Some(2));
    assert_eq!(cache.index(), CacheIndex::new(1, 0));
    assert_eq!(cache.lookup(&a, "").unwrap(), None);
    assert_eq!(cache.lookup(&b, "").unwrap(), None);
}

#[test]
fn size_at_budget_is_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let fragments = [Fragment::from("kernel")];
    let budget = entry_len(&fragments, "", b"bin");

    let mut cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, budget).unwrap();
    cache.store(&fragments, "", b"bin").unwrap();
    drop(cache);

    let cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, budget).unwrap();
    assert_eq!(cache.initial_wipe(), None);
    assert!(cache.lookup(&fragments, "").unwrap().is_some());
}

#[test]
fn foreign_entry_at_the_right_path_is_a_miss() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, 1 << 20).unwrap();
    let a = [Fragment::from("__kernel void a(){}")];
    let b = [Fragment::from("__kernel void b(){}")];

    cache.store(&a, "-O2", b"BINARY_A").unwrap();
    // Stand-in for a fingerprint collision: B's path now holds A's entry.
    std::fs::copy(cache.entry_path(&a, "-O2"), cache.entry_path(&b, "-O2")).unwrap();

    assert_eq!(cache.lookup(&b, "-O2").unwrap(), None);
    assert_eq!(cache.stats().collisions, 1);
    let log = std::fs::read_to_string(cache.diagnostics_log()).unwrap();
    assert!(log.contains("rejected entry"), "{log}");
}

#[test]
fn entry_from_another_format_version_is_a_miss() {
    let tmp = tempfile::tempdir().unwrap();
    let fragments = [Fragment::from("__kernel void k(){}")];

    let mut cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, 1 << 20).unwrap();
    cache.store(&fragments, "", b"bin").unwrap();
    let path = cache.entry_path(&fragments, "");

    let mut bytes = std::fs::read(&path).unwrap();
    let mut header_bytes = [0u8; ENTRY_HEADER_LEN];
    header_bytes.copy_from_slice(&bytes[..ENTRY_HEADER_LEN]);
    let mut header = EntryHeader::decode(&header_bytes).unwrap();
    header.format_version = 9;
    bytes[..ENTRY_HEADER_LEN].copy_from_slice(&header.encode().unwrap());
    std::fs::write(&path, &bytes).unwrap();

    assert_eq!(cache.lookup(&fragments, "").unwrap(), None);
}

#[test]
fn truncated_entry_is_a_miss() {
    let tmp = tempfile::tempdir().unwrap();
    let fragments = [Fragment::from("__kernel void k(){}")];

    let mut cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, 1 << 20).unwrap();
    cache.store(&fragments, "", b"a long enough binary").unwrap();
    let path = cache.entry_path(&fragments, "");
    let len = std::fs::metadata(&path).unwrap().len();
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 4)
        .unwrap();

    assert_eq!(cache.lookup(&fragments, "").unwrap(), None);
}

#[test]
fn explicit_wipe_reports_what_it_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = KernelCache::init(&config(tmp.path()), "gfx90a", 1, 1 << 20).unwrap();
    for i in 0..5 {
        let source = format!("__kernel void k{i}(){{}}");
        cache
            .store(&[Fragment::from(source.as_str())], "", b"bin")
            .unwrap();
    }

    let report = cache.wipe().unwrap();
    assert_eq!(
        report,
        WipeReport {
            removed_files: 5,
            removed_dirs: 16 + 256,
        }
    );
    assert_eq!(cache.index(), CacheIndex::new(1, 0));
}
