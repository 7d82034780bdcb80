//! Background worker feeding committed transactions into the B+ tree.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ledgerkv_appendable::Appendable;
use ledgerkv_tbtree::TBTree;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::reader::{committed_count, read_tx_at};
use crate::tx::Tx;
use crate::Result;

/// How long the worker dozes between checks when no commit notification
/// arrives. Commits notify the condvar, so this is a safety net, not the
/// steady-state cadence.
const IDLE_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct IndexerCtl {
    pub(crate) state: Mutex<IndexerState>,
    pub(crate) wake: Condvar,
}

pub(crate) struct IndexerState {
    pub(crate) shutdown: bool,
    /// First tree error, surfaced through `Store::index_info`. The worker
    /// parks once this is set; it never retries silently.
    pub(crate) error: Option<String>,
}

impl IndexerCtl {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(IndexerState {
                shutdown: false,
                error: None,
            }),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        self.wake.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }
}

/// Spawn the single indexer thread for a store.
///
/// The worker drains committed transactions in id order, applying every
/// entry (already sorted by key) as `key -> value reference` at
/// `ts = tx id`, checkpointing the tree every `flush_every` transactions.
/// On shutdown it finishes whatever is already committed, flushes, and
/// exits.
pub(crate) fn spawn(
    clog: Arc<dyn Appendable>,
    txlog: Arc<dyn Appendable>,
    tree: Arc<TBTree>,
    ctl: Arc<IndexerCtl>,
    flush_every: u64,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ledgerkv-indexer".into())
        .spawn(move || {
            if let Err(e) = run(&clog, &txlog, &tree, &ctl, flush_every) {
                warn!("indexer stopped on error: {e}");
                ctl.state.lock().error = Some(e.to_string());
                // Park until shutdown so the error stays observable.
                let mut state = ctl.state.lock();
                while !state.shutdown {
                    ctl.wake.wait(&mut state);
                }
            }
            if let Err(e) = tree.flush() {
                warn!("indexer: final flush failed: {e}");
            }
            debug!("indexer exited");
        })
        .expect("spawning the indexer thread")
}

fn run(
    clog: &Arc<dyn Appendable>,
    txlog: &Arc<dyn Appendable>,
    tree: &TBTree,
    ctl: &IndexerCtl,
    flush_every: u64,
) -> Result<()> {
    let mut tx = Tx::new();
    let mut buf = Vec::new();
    let mut since_flush = 0u64;

    loop {
        let committed = committed_count(clog.as_ref())?;
        let last_indexed = tree.ts()?;

        if last_indexed >= committed {
            let mut state = ctl.state.lock();
            if state.shutdown {
                return Ok(());
            }
            let _ = ctl.wake.wait_for(&mut state, IDLE_WAIT);
            continue;
        }

        for id in (last_indexed + 1)..=committed {
            // The ALH chain is irrelevant here; only keys and locators are.
            read_tx_at(clog.as_ref(), txlog.as_ref(), id, &mut buf, &mut tx, [0u8; 32])?;
            for entry in &tx.entries {
                tree.insert(&entry.key, &entry.value_ref().encode(), id)?;
            }
            // Checkpoints must land on transaction boundaries: a root
            // written mid-transaction would make recovery resume past the
            // unapplied half.
            since_flush += 1;
            if since_flush >= flush_every {
                tree.flush()?;
                since_flush = 0;
            }
        }
        debug!("indexer caught up to tx {committed}");
    }
}
