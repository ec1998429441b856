//! Corruption recovery through the public store.
//!
//! Damage is injected by flipping bytes inside row records of the on-disk
//! files, which breaks their checksums without disturbing framing.

use std::fs;
use std::path::Path;

use tempfile::tempdir;
use topsites::storage::persistent::{table, TableMeta, TABLE_FILE, WAL_FILE};
use topsites::{salvage, Health, RankRequest, SiteMetadata, StoreConfig, TopSitesStore};

fn config() -> StoreConfig {
    StoreConfig {
        sync_on_write: false,
        ..StoreConfig::default()
    }
}

fn open(dir: &Path) -> TopSitesStore {
    TopSitesStore::init_with_config(dir, config()).unwrap()
}

fn seed(store: &mut TopSitesStore, n: usize) {
    for i in 0..n {
        store
            .set_entry(&format!("http://site{i}/"), SiteMetadata::titled(format!("Site {i}")), RankRequest::last())
            .unwrap();
    }
}

/// Flip one byte inside the record for `url` in `file`.
fn damage(dir: &Path, file: &str, url: &str) {
    let path = dir.join(file);
    let mut bytes = fs::read(&path).unwrap();
    let needle = format!("\"url\":\"{url}\"");
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle.as_bytes())
        .unwrap_or_else(|| panic!("{url} not found in {file}"));
    bytes[at + 9] ^= 0x01;
    fs::write(&path, bytes).unwrap();
}

fn listing(store: &mut TopSitesStore) -> Vec<(String, u32)> {
    store
        .get_entries()
        .unwrap()
        .into_iter()
        .map(|e| (e.url, e.rank.organic().unwrap()))
        .collect()
}

/// N readable rows and M damaged ones: the triggering call answers "not
/// found" and the next call sees exactly the N rows, densely ranked.
#[test]
fn test_scenario_d_damage_under_open_store() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    seed(&mut store, 6);
    store.compact().unwrap().unwrap();

    damage(dir.path(), TABLE_FILE, "http://site1/");
    damage(dir.path(), TABLE_FILE, "http://site4/");

    assert_eq!(store.rank_of("http://site0/").unwrap(), None);
    assert_eq!(store.health(), Health::Healthy);

    assert_eq!(
        listing(&mut store),
        [
            ("http://site0/".to_string(), 0),
            ("http://site2/".to_string(), 1),
            ("http://site3/".to_string(), 2),
            ("http://site5/".to_string(), 3),
        ]
    );
    assert_eq!(store.rank_of("http://site0/").unwrap(), Some(0));
}

/// Each operation reports its own negative answer when it trips over damage.
#[test]
fn test_triggering_operations_return_negative_answers() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    seed(&mut store, 3);
    store.compact().unwrap().unwrap();

    damage(dir.path(), TABLE_FILE, "http://site2/");
    assert!(!store.remove_entry("http://site0/").unwrap());
    assert_eq!(store.get_entries().unwrap().len(), 2, "the remove was not retried");

    damage(dir.path(), TABLE_FILE, "http://site1/");
    assert!(!store.update_rank("http://site0/", RankRequest::Organic(1)).unwrap());

    damage(dir.path(), TABLE_FILE, "http://site0/");
    assert!(!store
        .set_entry("http://new/", SiteMetadata::default(), RankRequest::Organic(0))
        .unwrap());
    assert!(store.get_entries().unwrap().is_empty());

    // Fully usable afterwards.
    assert!(store.set_entry("http://new/", SiteMetadata::default(), RankRequest::Organic(0)).unwrap());
    assert_eq!(store.rank_of("http://new/").unwrap(), Some(0));
}

/// A get_entries that trips over damage answers with an empty listing.
#[test]
fn test_listing_during_recovery_is_empty() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    seed(&mut store, 3);
    store.compact().unwrap().unwrap();

    damage(dir.path(), TABLE_FILE, "http://site1/");
    assert!(store.get_entries().unwrap().is_empty());
    assert_eq!(store.get_entries().unwrap().len(), 2);
}

/// Damage inside the log, not only the table, is salvaged around.
#[test]
fn test_damaged_log_batch_is_skipped() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    seed(&mut store, 3);

    damage(dir.path(), WAL_FILE, "http://site1/");
    assert_eq!(store.rank_of("http://site2/").unwrap(), None);
    assert_eq!(
        listing(&mut store),
        [("http://site0/".to_string(), 0), ("http://site2/".to_string(), 1)]
    );
}

/// Pinned entries survive a rebuild ahead of the organic ones.
#[test]
fn test_pins_survive_rebuild() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    seed(&mut store, 3);
    store.set_entry("http://pinned/", SiteMetadata::default(), RankRequest::forced()).unwrap();
    store.compact().unwrap().unwrap();

    damage(dir.path(), TABLE_FILE, "http://site0/");
    store.get_entries().unwrap();

    let entries = store.get_entries().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].url, "http://pinned/");
    assert!(entries[0].rank.is_forced());
    assert_eq!(entries[1].rank.organic(), Some(0));
    assert_eq!(entries[2].rank.organic(), Some(1));
}

/// Damage found while opening is repaired before init returns.
#[test]
fn test_damage_found_at_init() {
    let dir = tempdir().unwrap();
    {
        let mut store = open(dir.path());
        seed(&mut store, 4);
        store.compact().unwrap().unwrap();
    }
    damage(dir.path(), TABLE_FILE, "http://site2/");

    let mut store = open(dir.path());
    assert_eq!(store.health(), Health::Healthy);
    assert_eq!(
        listing(&mut store),
        [
            ("http://site0/".to_string(), 0),
            ("http://site1/".to_string(), 1),
            ("http://site3/".to_string(), 2),
        ]
    );
}

/// A rebuild that cannot complete poisons the store until reinitialized.
#[test]
fn test_poisoned_store_until_reinitialized() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    seed(&mut store, 2);

    // Replaced underneath by a table from a newer build: unreadable and
    // not salvageable.
    table::write_table::<serde_json::Value>(&dir.path().join(TABLE_FILE), &TableMeta::new(9, 1), &[]).unwrap();

    let err = store.get_entries().unwrap_err();
    assert!(err.is_unavailable(), "got {err:?}");
    assert!(matches!(store.health(), Health::Poisoned(_)));
    assert!(store.rank_of("http://site0/").unwrap_err().is_unavailable());
    assert!(store.remove_entry("http://site0/").unwrap_err().is_unavailable());

    fs::remove_file(dir.path().join(TABLE_FILE)).unwrap();
    store.reinitialize().unwrap();
    assert_eq!(store.health(), Health::Healthy);
    assert!(store.set_entry("http://fresh/", SiteMetadata::default(), RankRequest::Organic(0)).unwrap());
}

/// The explicit salvage entry point reports what it kept and dropped.
#[test]
fn test_explicit_salvage_report() {
    let dir = tempdir().unwrap();
    {
        let mut store = open(dir.path());
        seed(&mut store, 5);
        store.compact().unwrap().unwrap();
    }
    damage(dir.path(), TABLE_FILE, "http://site3/");

    let report = salvage(dir.path(), false).unwrap();
    assert_eq!(report.recovered, 4);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.source_version, Some(3));

    // Salvage leaves ranks as observed; the store closes the gap on open.
    let mut store = open(dir.path());
    let ranks: Vec<u32> = listing(&mut store).into_iter().map(|(_, r)| r).collect();
    assert_eq!(ranks, [0, 1, 2, 3]);
}
