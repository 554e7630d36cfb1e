use super::*;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn small_config() -> StoreConfig {
    StoreConfig::builder()
        .staging_page_size(1024)
        .staging_cache_pages(4)
        .bucket_page_size(1024)
        .hot_rotation_limit(100)
        .hot_bloom_capacity(2000)
        .cold_bloom_capacity(2000)
        .build()
}

#[test]
fn put_get_round_trip() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("t.db"), small_config()).unwrap();
    assert_eq!(store.put(b"apple", b"1").unwrap(), PutStatus::Inserted);
    assert_eq!(store.put(b"apple", b"1").unwrap(), PutStatus::Updated);
    assert_eq!(store.get(b"apple").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"pear").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn layout_files_appear_on_disk() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("t.db");
    let mut store = Store::open(&base, small_config()).unwrap();
    store.put(b"k", b"v").unwrap();
    store.close().unwrap();

    // Bloom sidecars only appear once a demotion populates a filter
    for suffix in [".ix0", ".ix1", ".ix2"] {
        let mut name = base.as_os_str().to_os_string();
        name.push(suffix);
        assert!(
            std::path::PathBuf::from(&name).exists(),
            "{suffix} missing"
        );
    }
}

#[test]
fn value_longer_than_254_bytes_is_rejected() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("t.db"), small_config()).unwrap();
    assert!(store.put(b"k", &[0u8; 254]).is_ok());
    let err = store.put(b"k2", &[0u8; 255]).unwrap_err();
    assert!(matches!(err, StoreError::ValueTooLarge(255, 254)));
}

#[test]
fn oversized_key_is_rejected() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("t.db"), small_config()).unwrap();
    let key = vec![0u8; 256];
    assert!(matches!(
        store.put(&key, b"v").unwrap_err(),
        StoreError::KeyTooLarge(256)
    ));
    assert!(matches!(
        store.get(&key).unwrap_err(),
        StoreError::KeyTooLarge(256)
    ));
}

#[test]
fn misses_walk_the_probe_chain() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("t.db"), small_config()).unwrap();
    store.put(b"present", b"v").unwrap();
    assert_eq!(store.get(b"absent").unwrap(), None);
    assert_eq!(store.cold_probe_counters().lookups, 1);
    assert_eq!(store.hot_probe_counters().lookups, 1);
    // the empty filters reject the probe before it reaches the trees
    assert_eq!(store.cold_probe_counters().bloom_pass, 0);
    assert_eq!(store.hot_probe_counters().bloom_pass, 0);
    assert_eq!(store.cold_probe_counters().hits, 0);
    assert_eq!(store.hot_probe_counters().hits, 0);
    // a staging hit never touches the chain
    assert_eq!(store.get(b"present").unwrap(), Some(b"v".to_vec()));
    assert_eq!(store.cold_probe_counters().lookups, 1);
}

#[test]
fn disabled_bloom_still_answers() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::builder()
        .staging_page_size(1024)
        .staging_cache_pages(4)
        .bucket_page_size(1024)
        .bloom_filters(false)
        .build();
    let mut store = Store::open(dir.path().join("t.db"), config).unwrap();
    store.put(b"k", b"v").unwrap();
    assert_eq!(store.get(b"absent").unwrap(), None);
    // without filters every probe reaches the tree
    assert_eq!(store.cold_probe_counters().bloom_pass, 1);
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn repeated_puts_bump_the_staging_counter() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("t.db"), small_config()).unwrap();
    for _ in 0..300 {
        store.put(b"hot-key", b"v").unwrap();
    }
    // the counter saturates instead of wrapping
    assert_eq!(store.get(b"hot-key").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn update_with_different_value_length_wins() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("t.db"), small_config()).unwrap();
    store.put(b"k", b"short").unwrap();
    assert_eq!(store.put(b"k", b"a-much-longer-value").unwrap(), PutStatus::Updated);
    assert_eq!(store.get(b"k").unwrap(), Some(b"a-much-longer-value".to_vec()));
    store.put(b"k", b"s").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"s".to_vec()));
}

#[test]
fn knob_open_works() {
    let dir = tempdir().unwrap();
    let mut store = Store::open_with_knob(dir.path().join("t.db"), 1).unwrap();
    store.put(b"k", b"v").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    store.close().unwrap();
}
