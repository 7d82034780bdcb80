#![allow(dead_code)]

use ledgerkv_merkle::htree::verify_inclusion;
use ledgerkv_store::{Store, Tx, KV};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

/// Commit `ntx` transactions of `nentries` entries each, where entry
/// `(i, j)` maps key `(i << 4) + j` to value `(i << 4) + (nentries - j)`.
pub fn commit_grid(store: &Store, ntx: u64, nentries: u64) {
    for i in 0..ntx {
        let entries: Vec<KV> = (0..nentries)
            .map(|j| KV::new(key((i << 4) + j), key((i << 4) + (nentries - j))))
            .collect();
        let summary = store.commit(entries).unwrap();
        assert_eq!(summary.id, i + 1);
        assert_eq!(summary.nentries, nentries as u32);
    }
}

/// Stream every committed transaction from `from_id`, checking ids are
/// dense and every entry's inclusion proof and value bytes hold up.
pub fn verify_all_committed(store: &Store, from_id: u64, expected_last: u64) {
    let mut reader = store.tx_reader(from_id, 1024).unwrap();
    let mut expected_id = from_id;
    while let Some(tx) = reader.read().unwrap() {
        assert_eq!(tx.header.id, expected_id, "tx ids must be dense");
        verify_tx(store, tx);
        expected_id += 1;
    }
    assert_eq!(expected_id, expected_last + 1, "unexpected number of transactions");
}

/// Every entry of `tx` verifies inclusion against `eh` and hashes back to
/// its stored value digest.
pub fn verify_tx(store: &Store, tx: &Tx) {
    for (j, entry) in tx.entries.iter().enumerate() {
        let proof = store.inclusion_proof(tx.header.id, j as u32).unwrap();
        assert!(
            verify_inclusion(&proof, &entry.digest(), &tx.header.eh),
            "inclusion proof failed for tx {} entry {}",
            tx.header.id,
            j
        );

        let value = store.read_value(tx, &entry.key).unwrap();
        assert_eq!(value.len(), entry.value_len as usize);
    }
}
