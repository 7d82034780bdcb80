//! Crash-safety under randomly failing appends.
//!
//! The logs are wrapped in a fault injector whose `append` sometimes
//! writes only a prefix of the bytes before failing, leaving torn tails
//! and interior garbage the way a crashed process would. Reopening with
//! the real logs must recover exactly the successful commits.

mod common;

use std::io;
use std::sync::Arc;

use ledgerkv_appendable::{Appendable, MultiAppend, Options as AppendableOptions};
use ledgerkv_store::{Options, Store, KV};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use common::key;

struct FaultyAppendable {
    inner: Arc<dyn Appendable>,
    fail_rate: f64,
    rng: Mutex<StdRng>,
}

impl FaultyAppendable {
    fn new(inner: Arc<dyn Appendable>, fail_rate: f64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }
}

impl Appendable for FaultyAppendable {
    fn metadata(&self) -> ledgerkv_appendable::Result<Vec<u8>> {
        self.inner.metadata()
    }

    fn size(&self) -> ledgerkv_appendable::Result<u64> {
        self.inner.size()
    }

    fn offset(&self) -> ledgerkv_appendable::Result<u64> {
        self.inner.offset()
    }

    fn set_offset(&self, off: u64) -> ledgerkv_appendable::Result<()> {
        self.inner.set_offset(off)
    }

    fn append(&self, bytes: &[u8]) -> ledgerkv_appendable::Result<(u64, usize)> {
        if self.rng.lock().random_bool(self.fail_rate) {
            // A torn write: half the bytes land, then the failure.
            let torn = bytes.len() / 2;
            if torn > 0 {
                self.inner.append(&bytes[..torn])?;
            }
            return Err(ledgerkv_appendable::Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected append failure",
            )));
        }
        self.inner.append(bytes)
    }

    fn flush(&self) -> ledgerkv_appendable::Result<()> {
        self.inner.flush()
    }

    fn sync(&self) -> ledgerkv_appendable::Result<()> {
        self.inner.sync()
    }

    fn read_at(&self, dst: &mut [u8], off: u64) -> ledgerkv_appendable::Result<usize> {
        self.inner.read_at(dst, off)
    }

    fn close(&self) -> ledgerkv_appendable::Result<()> {
        self.inner.close()
    }
}

fn log_opts(ext: &str) -> AppendableOptions {
    AppendableOptions {
        file_ext: ext.into(),
        ..AppendableOptions::default()
    }
}

#[test]
fn torn_tails_recover_to_exactly_the_successful_commits() {
    common::init_logging();
    let dir = tempdir().unwrap();

    let vlog = Arc::new(MultiAppend::open(dir.path().join("val_0"), log_opts("val")).unwrap());
    let txlog = Arc::new(MultiAppend::open(dir.path().join("tx"), log_opts("tx")).unwrap());
    let clog = Arc::new(MultiAppend::open(dir.path().join("commit"), log_opts("txi")).unwrap());

    let faulty_vlog = FaultyAppendable::new(vlog, 0.02, 1);
    let faulty_txlog = FaultyAppendable::new(txlog, 0.05, 2);
    let faulty_clog = FaultyAppendable::new(clog, 0.05, 3);

    let store = Store::open_with(
        dir.path(),
        vec![faulty_vlog as Arc<dyn Appendable>],
        faulty_txlog as Arc<dyn Appendable>,
        faulty_clog as Arc<dyn Appendable>,
        Options::default(),
    )
    .unwrap();

    let mut successes = 0u64;
    let mut failures = 0u64;
    for i in 0..100u64 {
        let entries: Vec<KV> = (0..10u64)
            .map(|j| KV::new(key(i * 100 + j), key(i + j)))
            .collect();
        match store.commit(entries) {
            Ok(summary) => {
                successes += 1;
                assert_eq!(summary.id, successes, "successful ids must stay dense");
            }
            Err(_) => failures += 1,
        }
    }
    assert_eq!(successes + failures, 100);
    assert!(failures > 0, "the injector should have fired at these rates");
    assert_eq!(store.tx_count().unwrap(), successes);

    // Close may hit injected faults during the final flush; losing
    // buffered-but-uncommitted bytes is exactly what recovery handles.
    let _ = store.close();
    drop(store);

    // Reopen with the real logs.
    let store = Store::open(dir.path(), Options::default()).unwrap();
    assert_eq!(store.tx_count().unwrap(), successes);
    common::verify_all_committed(&store, 1, successes);
    store.close().unwrap();
}
