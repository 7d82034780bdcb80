//! Secondary-index behavior: historical queries, snapshot semantics and
//! indexer lifecycle.

mod common;

use std::time::{Duration, Instant};

use ledgerkv_store::{Error, Options, Store, KV};
use tempfile::tempdir;

use common::key;

/// Poll `index_info` until the indexer has integrated tx `target`.
fn wait_for_indexer(store: &Store, target: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let info = store.index_info().unwrap();
        assert!(info.error.is_none(), "indexer error: {:?}", info.error);
        if info.ts >= target {
            return;
        }
        assert!(Instant::now() < deadline, "indexer did not catch up in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn historical_queries_return_every_version() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();

    // 10 transactions, each writing the same 100 keys; tx i+1 writes
    // value i.
    for i in 0..10u64 {
        let entries: Vec<KV> = (0..100u64).map(|j| KV::new(key(j), key(i))).collect();
        let summary = store.commit(entries).unwrap();
        assert_eq!(summary.id, i + 1);
    }

    wait_for_indexer(&store, 10);
    let snapshot = store.snapshot().unwrap();
    assert!(snapshot.ts() >= 10);

    let mut tx = store.new_tx();
    for j in 0..100u64 {
        let tx_ids = snapshot.get_ts(&key(j), 10).unwrap();
        assert_eq!(tx_ids, (1..=10u64).rev().collect::<Vec<_>>(), "key {j}");

        // Each historical version reads back its value through the tx log.
        for (age, id) in tx_ids.iter().enumerate() {
            store.read_tx(*id, &mut tx).unwrap();
            let value = store.read_value(&tx, &key(j)).unwrap();
            assert_eq!(value, key(9 - age as u64));
        }

        // The newest version is also what the point query returns.
        let (vref, ts) = snapshot.get(&key(j)).unwrap();
        assert_eq!(ts, 10);
        assert_eq!(vref.value_len, 8);
        let mut value = vec![0u8; vref.value_len as usize];
        store
            .read_value_at(&mut value, vref.vlog_id, vref.voff, &vref.hvalue)
            .unwrap();
        assert_eq!(value, key(9));
    }

    store.close().unwrap();
}

#[test]
fn snapshots_are_monotone() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();

    store.commit(vec![KV::new("a", "1")]).unwrap();
    wait_for_indexer(&store, 1);

    let s1 = store.snapshot().unwrap();
    let s2 = store.snapshot().unwrap();
    assert!(s2.ts() >= s1.ts());

    store.commit(vec![KV::new("a", "2")]).unwrap();
    wait_for_indexer(&store, 2);
    let s3 = store.snapshot().unwrap();
    assert!(s3.ts() >= s2.ts());

    // Old snapshots keep serving their view.
    let (vref, ts) = s1.get(b"a").unwrap();
    assert_eq!(ts, 1);
    let mut value = vec![0u8; vref.value_len as usize];
    store
        .read_value_at(&mut value, vref.vlog_id, vref.voff, &vref.hvalue)
        .unwrap();
    assert_eq!(value, b"1");
    assert_eq!(s3.get(b"a").unwrap().1, 2);

    store.close().unwrap();
}

#[test]
fn closed_snapshot_rejects_reads() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();
    store.commit(vec![KV::new("a", "1")]).unwrap();
    wait_for_indexer(&store, 1);

    let mut snapshot = store.snapshot().unwrap();
    snapshot.close().unwrap();
    assert!(matches!(snapshot.get(b"a"), Err(Error::AlreadyClosed)));
    assert!(matches!(snapshot.close(), Err(Error::AlreadyClosed)));

    store.close().unwrap();
}

#[test]
fn index_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();
    for i in 0..20u64 {
        store.commit(vec![KV::new(key(i % 5), key(i))]).unwrap();
    }
    wait_for_indexer(&store, 20);
    store.close().unwrap();
    drop(store);

    let store = Store::open(dir.path(), Options::default()).unwrap();
    // Close checkpointed the tree, so the reopened index resumes complete.
    wait_for_indexer(&store, 20);
    let snapshot = store.snapshot().unwrap();
    for j in 0..5u64 {
        let tx_ids = snapshot.get_ts(&key(j), 100).unwrap();
        assert_eq!(tx_ids.len(), 4, "key {j} is written by 4 of the 20 txs");
        assert!(tx_ids.windows(2).all(|w| w[0] > w[1]), "newest first");
    }
    store.close().unwrap();
}

#[test]
fn indexer_converges_across_reopens() {
    let dir = tempdir().unwrap();

    let store = Store::open(dir.path(), Options::default()).unwrap();
    for i in 0..30u64 {
        store.commit(vec![KV::new(key(i), key(i))]).unwrap();
    }
    store.close().unwrap();
    drop(store);

    // New commits after reopen must be integrated on top of whatever the
    // previous session left indexed.
    let store = Store::open(dir.path(), Options::default()).unwrap();
    for i in 30..40u64 {
        store.commit(vec![KV::new(key(i), key(i))]).unwrap();
    }
    wait_for_indexer(&store, 40);
    let snapshot = store.snapshot().unwrap();
    for i in 0..40u64 {
        assert_eq!(snapshot.get(&key(i)).unwrap().1, i + 1);
    }
    store.close().unwrap();
}
