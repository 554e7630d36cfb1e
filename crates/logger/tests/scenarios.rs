//! End-to-end scenarios over the tiered store: persistence, demotion,
//! rotation and Bloom gating.

use common::StoreConfig;
use logger::{PutStatus, Store};
use std::path::PathBuf;

fn sweep_config() -> StoreConfig {
    StoreConfig::builder()
        .staging_page_size(1024)
        .staging_cache_pages(4)
        .bucket_page_size(1024)
        .hot_rotation_limit(100)
        .hot_bloom_capacity(4000)
        .cold_bloom_capacity(4000)
        .build()
}

fn sidecar(base: &PathBuf, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[test]
fn basic_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("t.db");
    let config = StoreConfig::builder()
        .hot_bloom_capacity(1000)
        .cold_bloom_capacity(1000)
        .build();
    {
        let mut store = Store::open(&base, config.clone()).unwrap();
        assert_eq!(store.put(b"apple", b"1").unwrap(), PutStatus::Inserted);
        assert_eq!(store.put(b"banana", b"2").unwrap(), PutStatus::Inserted);
        assert_eq!(store.get(b"apple").unwrap(), Some(b"1".to_vec()));
        store.close().unwrap();
    }
    let mut store = Store::open(&base, config).unwrap();
    assert_eq!(store.get(b"banana").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.get(b"apple").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn frequency_demotion_fills_the_hot_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("t.db");
    // rotation off, so everything demoted stays in the live hot bucket
    let config = StoreConfig::builder()
        .staging_page_size(1024)
        .staging_cache_pages(4)
        .bucket_page_size(1024)
        .aged_cache_mb(0)
        .hot_bloom_capacity(4000)
        .cold_bloom_capacity(4000)
        .build();
    let mut store = Store::open(&base, config).unwrap();
    let count = 3000u32;
    for _pass in 0..3 {
        for n in 0..count {
            store
                .put(format!("key{n}").as_bytes(), format!("val{n}").as_bytes())
                .unwrap();
        }
    }
    assert!(store.hot_len() > 0, "no demotion into the hot bucket");
    for n in 0..count {
        assert_eq!(
            store.get(format!("key{n}").as_bytes()).unwrap(),
            Some(format!("val{n}").into_bytes()),
            "key{n} lost after demotion"
        );
    }
    // the sweeps were recorded against staging pages
    assert!(store.flush_counts().iter().any(|&c| c > 0));
}

#[test]
fn rotation_spawns_numbered_aged_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("t.db");
    let mut store = Store::open(&base, sweep_config()).unwrap();
    let count = 2000u32;
    for n in 0..count {
        store
            .put(format!("r{:06}", n).as_bytes(), b"x").unwrap();
    }
    assert!(
        store.aged_count() >= 3,
        "expected at least 3 rotations, saw {}",
        store.aged_count()
    );
    for slot in 1..=3 {
        assert!(
            sidecar(&base, &format!(".ix1.{slot}")).exists(),
            "aged bucket file {slot} missing"
        );
    }
    for n in 0..count {
        assert_eq!(
            store.get(format!("r{:06}", n).as_bytes()).unwrap(),
            Some(b"x".to_vec()),
            "r{:06} lost across rotation",
            n
        );
    }
}

#[test]
fn reopen_after_rotation_recovers_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("t.db");
    let count = 2000u32;
    let aged_before;
    {
        let mut store = Store::open(&base, sweep_config()).unwrap();
        for n in 0..count {
            store
                .put(format!("p{:06}", n).as_bytes(), format!("{n}").as_bytes())
                .unwrap();
        }
        aged_before = store.aged_count();
        assert!(aged_before >= 1);
        store.close().unwrap();
    }
    let mut store = Store::open(&base, sweep_config()).unwrap();
    assert_eq!(store.aged_count(), aged_before);
    for n in 0..count {
        assert_eq!(
            store.get(format!("p{:06}", n).as_bytes()).unwrap(),
            Some(format!("{n}").into_bytes()),
            "p{:06} lost across reopen",
            n
        );
    }
}

#[test]
fn bloom_filters_short_circuit_absent_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("t.db");
    {
        let mut store = Store::open(&base, sweep_config()).unwrap();
        for n in 0..2000u32 {
            store
                .put(format!("b{:06}", n).as_bytes(), b"v").unwrap();
        }
        assert!(store.aged_count() >= 1);
        store.close().unwrap();
    }
    // fresh handle, fresh counters, filters imported from the sidecars
    let mut store = Store::open(&base, sweep_config()).unwrap();
    let probes = 10_000u32;
    for n in 0..probes {
        assert_eq!(store.get(format!("absent-{n}").as_bytes()).unwrap(), None);
    }
    let mut bloom_pass = store.cold_probe_counters().bloom_pass + store.hot_probe_counters().bloom_pass;
    for counters in store.aged_probe_counters() {
        assert_eq!(counters.hits, 0, "an absent key cannot hit an aged bucket");
        assert_eq!(counters.lookups, probes as u64);
        bloom_pass += counters.bloom_pass;
    }
    assert_eq!(store.cold_probe_counters().hits, 0);
    assert_eq!(store.hot_probe_counters().hits, 0);
    // 0.5% target rate with a wide margin, summed over every bucket
    assert!(
        bloom_pass < 2000,
        "bloom filters admitted {bloom_pass} of {probes} absent probes"
    );
}

#[test]
fn mixed_reads_hit_every_tier() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("t.db");
    let mut store = Store::open(&base, sweep_config()).unwrap();
    // skewed workload: a few keys written repeatedly, many written once
    for n in 0..1500u32 {
        store
            .put(format!("one-{n}").as_bytes(), b"cold-path").unwrap();
        if n % 10 == 0 {
            store.put(b"favourite", b"hot-path").unwrap();
        }
    }
    assert_eq!(store.get(b"favourite").unwrap(), Some(b"hot-path".to_vec()));
    for n in 0..1500u32 {
        assert_eq!(
            store.get(format!("one-{n}").as_bytes()).unwrap(),
            Some(b"cold-path".to_vec())
        );
    }
    assert!(store.size() > 0);
    assert!(store.max_key_len() >= 8);
}
