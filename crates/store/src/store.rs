//! The transaction store: three-log layout, commit pipeline, recovery and
//! proof assembly.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, unbounded, Sender};
use fs2::FileExt as _;
use ledgerkv_appendable::{
    read_exact_at, Appendable, MultiAppend, Options as AppendableOptions,
};
use ledgerkv_merkle::ahtree::AHTree;
use ledgerkv_merkle::htree::InclusionProof;
use ledgerkv_merkle::Digest;
use ledgerkv_tbtree::{Options as TreeOptions, TBTree};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::indexer::{self, IndexerCtl};
use crate::options::Options;
use crate::proofs::{DualProof, LinearProof};
use crate::reader::{commit_record, read_tx_at, TxReader, COMMIT_RECORD_LEN};
use crate::tx::{
    encode_entries, encode_header, hash_value, Tx, TxEntry, TxHeader, TxSummary, ValueRef, KV,
};
use crate::{Error, Result};

const LOCK_FILE: &str = ".lock";

/// Last tx id the indexer integrated, plus the first indexing error if the
/// worker stopped on one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexInfo {
    pub ts: u64,
    pub error: Option<String>,
}

/// A read-only view of the secondary index. See [`Store::snapshot`].
pub struct Snapshot {
    inner: ledgerkv_tbtree::Snapshot,
}

impl Snapshot {
    /// The tx id this snapshot is consistent with.
    pub fn ts(&self) -> u64 {
        self.inner.ts()
    }

    /// Newest value reference for `key` and the tx id that wrote it.
    pub fn get(&self, key: &[u8]) -> Result<(ValueRef, u64)> {
        let (value, ts) = self.inner.get(key)?;
        Ok((ValueRef::decode(&value)?, ts))
    }

    /// Tx ids that wrote `key`, newest first, at most `limit` of them.
    pub fn get_ts(&self, key: &[u8], limit: usize) -> Result<Vec<u64>> {
        Ok(self.inner.get_ts(key, limit)?)
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(self.inner.close()?)
    }
}

struct Gate {
    closed: bool,
    in_flight: usize,
}

struct CommitState {
    ntx: u64,
    /// `alhs[i]` is the ALH of transaction `i + 1`.
    alhs: Vec<Digest>,
    /// Binary-linking tree; leaf `i` is the ALH of transaction `i + 1`.
    aht: AHTree,
}

impl CommitState {
    fn last_alh(&self) -> Digest {
        self.alhs.last().copied().unwrap_or([0u8; 32])
    }

    fn prev_alh_of(&self, id: u64) -> Digest {
        if id > 1 {
            self.alhs[id as usize - 2]
        } else {
            [0u8; 32]
        }
    }
}

struct IoJob {
    sync: bool,
    reply: Sender<Result<()>>,
}

struct IoPool {
    senders: Vec<Sender<IoJob>>,
    handles: Vec<JoinHandle<()>>,
}

struct Index {
    tree: Arc<TBTree>,
    ctl: Arc<IndexerCtl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct Store {
    opts: Options,
    /// Held for the store's lifetime; exclusivity against other processes.
    /// Released (dropped) on close.
    lock_file: Mutex<Option<File>>,

    vlogs: Vec<Arc<dyn Appendable>>,
    txlog: Arc<dyn Appendable>,
    clog: Arc<dyn Appendable>,

    /// Serializes the commit linearization step and owns the ALH state.
    state: Mutex<CommitState>,
    /// Commit admission and close coordination.
    gate: Mutex<Gate>,
    gate_cv: Condvar,

    vlog_rr: AtomicUsize,
    io: Mutex<IoPool>,
    index: Index,
}

impl Store {
    /// Open (or create) the store rooted at `path`, building the three
    /// multi-appendable logs and the index underneath it.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Store> {
        opts.validate()?;
        let path = path.as_ref();

        if path.exists() && !path.is_dir() {
            return Err(Error::PathIsNotADirectory(path.display().to_string()));
        }
        if !path.exists() {
            if opts.read_only {
                return Err(Error::IllegalArguments("path"));
            }
            create_dir_with_mode(path, opts.file_mode)?;
        }

        // How many value logs exist on disk wins over the option; a fresh
        // store gets `max_io_concurrency` of them.
        let mut nvlogs = 0;
        while path.join(format!("val_{nvlogs}")).is_dir() {
            nvlogs += 1;
        }
        if nvlogs == 0 {
            nvlogs = opts.max_io_concurrency;
        } else if nvlogs != opts.max_io_concurrency {
            debug!(
                "store {}: {nvlogs} value logs on disk override max_io_concurrency={}",
                path.display(),
                opts.max_io_concurrency
            );
        }

        let mut vlogs: Vec<Arc<dyn Appendable>> = Vec::with_capacity(nvlogs);
        for i in 0..nvlogs {
            vlogs.push(Arc::new(MultiAppend::open(
                path.join(format!("val_{i}")),
                AppendableOptions {
                    file_ext: "val".into(),
                    compression: opts.compression_format,
                    compression_level: opts.compression_level,
                    ..log_appendable_opts(&opts)
                },
            )?));
        }
        let txlog: Arc<dyn Appendable> = Arc::new(MultiAppend::open(
            path.join("tx"),
            AppendableOptions {
                file_ext: "tx".into(),
                metadata: encode_limits(&opts),
                ..log_appendable_opts(&opts)
            },
        )?);
        let clog: Arc<dyn Appendable> = Arc::new(MultiAppend::open(
            path.join("commit"),
            AppendableOptions {
                file_ext: "txi".into(),
                ..log_appendable_opts(&opts)
            },
        )?);

        Self::open_with(path, vlogs, txlog, clog, opts)
    }

    /// Open the store over caller-provided logs. `path` still hosts the
    /// directory lock and the secondary index.
    pub fn open_with(
        path: impl AsRef<Path>,
        vlogs: Vec<Arc<dyn Appendable>>,
        txlog: Arc<dyn Appendable>,
        clog: Arc<dyn Appendable>,
        opts: Options,
    ) -> Result<Store> {
        opts.validate()?;
        if vlogs.is_empty() || vlogs.len() > u8::MAX as usize {
            return Err(Error::IllegalArguments("vlogs"));
        }
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::PathIsNotADirectory(path.display().to_string()));
        }

        let lock_file = acquire_dir_lock(path)?;

        let state = recover(&vlogs, txlog.as_ref(), clog.as_ref(), &opts)?;
        info!(
            "store {}: opened with {} committed transactions",
            path.display(),
            state.ntx
        );

        // One I/O worker per value log; commits offload their value-log
        // flush/sync to it and join before the linearization point.
        let mut senders = Vec::with_capacity(vlogs.len());
        let mut handles = Vec::with_capacity(vlogs.len());
        if !opts.read_only {
            for (i, vlog) in vlogs.iter().enumerate() {
                let (tx, rx) = unbounded::<IoJob>();
                let vlog = Arc::clone(vlog);
                let handle = thread::Builder::new()
                    .name(format!("ledgerkv-vlog-{i}"))
                    .spawn(move || {
                        for job in rx {
                            let res = if job.sync { vlog.sync() } else { vlog.flush() };
                            let _ = job.reply.send(res.map_err(Error::from));
                        }
                    })
                    .expect("spawning a value-log worker");
                senders.push(tx);
                handles.push(handle);
            }
        }

        let index_dir = path.join("index");
        let nodes: Arc<dyn Appendable> = Arc::new(MultiAppend::open(
            index_dir.join("nodes"),
            AppendableOptions {
                file_ext: "idx".into(),
                ..log_appendable_opts(&opts)
            },
        )?);
        let roots: Arc<dyn Appendable> = Arc::new(MultiAppend::open(
            index_dir.join("roots"),
            AppendableOptions {
                file_ext: "ri".into(),
                ..log_appendable_opts(&opts)
            },
        )?);
        let tree = Arc::new(TBTree::open(
            nodes,
            roots,
            TreeOptions {
                read_only: opts.read_only,
                ..TreeOptions::default()
            },
        )?);

        let ctl = Arc::new(IndexerCtl::new());
        let handle = if opts.read_only {
            None
        } else {
            Some(indexer::spawn(
                Arc::clone(&clog),
                Arc::clone(&txlog),
                Arc::clone(&tree),
                Arc::clone(&ctl),
                opts.flush_every,
            ))
        };

        Ok(Store {
            opts,
            lock_file: Mutex::new(Some(lock_file)),
            vlogs,
            txlog,
            clog,
            state: Mutex::new(state),
            gate: Mutex::new(Gate {
                closed: false,
                in_flight: 0,
            }),
            gate_cv: Condvar::new(),
            vlog_rr: AtomicUsize::new(0),
            io: Mutex::new(IoPool { senders, handles }),
            index: Index {
                tree,
                ctl,
                handle: Mutex::new(handle),
            },
        })
    }

    /// Commit a batch of entries as one transaction.
    ///
    /// Entries are sorted by key; value bytes go to one value log whose
    /// flush/sync runs on its I/O worker while the entry section and the
    /// per-transaction Merkle tree are built. The commit mutex then assigns
    /// the id, finalizes the tx-log record, joins the value-log worker and
    /// appends the commit-log record (the linearization point), so no
    /// commit record ever references unwritten value bytes.
    pub fn commit(&self, entries: Vec<KV>) -> Result<TxSummary> {
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }

        {
            let mut gate = self.gate.lock();
            if gate.closed {
                return Err(Error::AlreadyClosed);
            }
            if gate.in_flight >= self.opts.max_concurrency {
                return Err(Error::MaxConcurrencyExceeded);
            }
            gate.in_flight += 1;
        }

        let result = self.commit_inner(entries);

        {
            let mut gate = self.gate.lock();
            gate.in_flight -= 1;
            self.gate_cv.notify_all();
        }
        if result.is_ok() {
            self.index.ctl.notify();
        }
        result
    }

    fn commit_inner(&self, entries: Vec<KV>) -> Result<TxSummary> {
        if entries.is_empty() {
            return Err(Error::NoEntriesProvided);
        }
        if entries.len() > self.opts.max_tx_entries as usize {
            return Err(Error::MaxTxEntriesExceeded);
        }
        for kv in &entries {
            if kv.key.is_empty() {
                return Err(Error::IllegalArguments("key"));
            }
            if kv.key.len() > self.opts.max_key_len as usize {
                return Err(Error::MaxKeyLenExceeded);
            }
            if kv.value.len() > self.opts.max_value_len as usize {
                return Err(Error::MaxValueLenExceeded);
            }
        }

        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by(|&a, &b| entries[a].key.cmp(&entries[b].key));
        for pair in order.windows(2) {
            if entries[pair[0]].key == entries[pair[1]].key {
                return Err(Error::DuplicatedKey);
            }
        }

        // Claim value-log offsets; all of a transaction's values go to one
        // log, contiguously, in entry order.
        let vlog_id = self.vlog_rr.fetch_add(1, Ordering::Relaxed) % self.vlogs.len();
        let total: usize = entries.iter().map(|kv| kv.value.len()).sum();
        let mut voffs = vec![0u64; entries.len()];
        if total > 0 {
            let mut payload = Vec::with_capacity(total);
            for &i in &order {
                payload.extend_from_slice(&entries[i].value);
            }
            let (base, _) = self.vlogs[vlog_id].append(&payload)?;
            let mut off = base;
            for &i in &order {
                voffs[i] = off;
                off += entries[i].value.len() as u64;
            }
        }

        // Offload the value-log I/O while hashing and serializing.
        let reply_rx = if total > 0 {
            let (reply_tx, reply_rx) = bounded(1);
            let sender = {
                let pool = self.io.lock();
                pool.senders
                    .get(vlog_id)
                    .cloned()
                    .ok_or(Error::AlreadyClosed)?
            };
            sender
                .send(IoJob {
                    sync: self.opts.synced,
                    reply: reply_tx,
                })
                .map_err(|_| Error::AlreadyClosed)?;
            Some(reply_rx)
        } else {
            None
        };

        let tx_entries: Vec<TxEntry> = order
            .iter()
            .map(|&i| TxEntry {
                key: entries[i].key.clone(),
                value_len: entries[i].value.len() as u32,
                vlog_id: vlog_id as u8,
                voff: voffs[i],
                hvalue: hash_value(&entries[i].value),
            })
            .collect();
        let entries_buf = encode_entries(&tx_entries);
        let digests: Vec<Digest> = tx_entries.iter().map(|e| e.digest()).collect();
        let eh = ledgerkv_merkle::htree::HTree::new(&digests)?.root();

        // Join barrier: value bytes must be on their way to disk before a
        // commit record can reference them.
        if let Some(rx) = reply_rx {
            rx.recv().map_err(|_| Error::AlreadyClosed)??;
        }

        let mut state = self.state.lock();
        let id = state.ntx + 1;
        let header = TxHeader {
            id,
            ts: now_secs(),
            bl_tx_id: id - 1,
            bl_root: state.aht.root(),
            nentries: tx_entries.len() as u32,
            eh,
            prev_alh: state.last_alh(),
        };

        let mut record = encode_header(&header).to_vec();
        record.extend_from_slice(&entries_buf);
        let (txoff, _) = self.txlog.append(&record)?;
        if self.opts.synced {
            self.txlog.sync()?;
        }

        let alh = header.alh();
        let mut crec = [0u8; COMMIT_RECORD_LEN as usize];
        crec[..8].copy_from_slice(&txoff.to_be_bytes());
        crec[8..].copy_from_slice(&(record.len() as u64).to_be_bytes());

        // The commit log is a fixed-record file: a failed (possibly
        // partial) append or sync must be rolled back, or every later
        // record would be misaligned.
        let commit_res = self.clog.append(&crec).map(|_| ()).and_then(|()| {
            if self.opts.synced {
                self.clog.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = commit_res {
            if let Err(rollback) = self.clog.set_offset(state.ntx * COMMIT_RECORD_LEN) {
                warn!("commit-log rollback failed, closing the store: {rollback}");
                self.gate.lock().closed = true;
            }
            return Err(e.into());
        }

        state.aht.append(&alh);
        state.alhs.push(alh);
        state.ntx = id;
        drop(state);

        Ok(TxSummary {
            id,
            ts: header.ts,
            alh,
            nentries: header.nentries,
        })
    }

    /// Number of committed transactions.
    pub fn tx_count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.state.lock().ntx)
    }

    /// Latest transaction id and its ALH.
    pub fn current_state(&self) -> Result<(u64, Digest)> {
        self.check_open()?;
        let state = self.state.lock();
        Ok((state.ntx, state.last_alh()))
    }

    /// The ALH of transaction `id`, from the in-memory chain cache.
    pub fn alh(&self, id: u64) -> Result<Digest> {
        self.check_open()?;
        let state = self.state.lock();
        if id == 0 || id > state.ntx {
            return Err(Error::TxNotFound(id));
        }
        Ok(state.alhs[id as usize - 1])
    }

    /// A reusable transaction decode buffer.
    pub fn new_tx(&self) -> Tx {
        Tx::new()
    }

    /// Read transaction `id` into `tx`.
    pub fn read_tx(&self, id: u64, tx: &mut Tx) -> Result<()> {
        self.check_open()?;
        let prev_alh = {
            let state = self.state.lock();
            if id == 0 || id > state.ntx {
                return Err(Error::TxNotFound(id));
            }
            state.prev_alh_of(id)
        };
        let mut buf = Vec::new();
        read_tx_at(self.clog.as_ref(), self.txlog.as_ref(), id, &mut buf, tx, prev_alh)
    }

    /// Stream transactions in id order starting at `from_id`. `buf_size`
    /// sizes the reader's scratch buffer.
    pub fn tx_reader(&self, from_id: u64, buf_size: usize) -> Result<TxReader> {
        self.check_open()?;
        if from_id == 0 {
            return Err(Error::IllegalArguments("from_id"));
        }
        let prev_alh = {
            let state = self.state.lock();
            if from_id > state.ntx + 1 {
                return Err(Error::TxNotFound(from_id));
            }
            state.prev_alh_of(from_id)
        };
        Ok(TxReader::new(
            Arc::clone(&self.clog),
            Arc::clone(&self.txlog),
            from_id,
            buf_size,
            prev_alh,
        ))
    }

    /// The value bytes of `tx`'s entry for `key`, verified against the
    /// entry's stored hash.
    pub fn read_value(&self, tx: &Tx, key: &[u8]) -> Result<Vec<u8>> {
        let entry = tx.entry(key)?;
        let mut value = vec![0u8; entry.value_len as usize];
        self.read_value_at(&mut value, entry.vlog_id, entry.voff, &entry.hvalue)?;
        Ok(value)
    }

    /// Read `dst.len()` value bytes at `voff` of value log `vlog_id` and
    /// verify them against `hvalue`. A mismatch is a fatal integrity error
    /// for this read, not for the store.
    pub fn read_value_at(&self, dst: &mut [u8], vlog_id: u8, voff: u64, hvalue: &Digest) -> Result<()> {
        self.check_open()?;
        let vlog = self
            .vlogs
            .get(vlog_id as usize)
            .ok_or(Error::IllegalArguments("vlog_id"))?;
        if !dst.is_empty() {
            read_exact_at(vlog.as_ref(), dst, voff)?;
        }
        if hash_value(dst) != *hvalue {
            return Err(Error::CorruptedValueData { vlog_id, voff });
        }
        Ok(())
    }

    /// Inclusion proof of entry `entry_index` within transaction `tx_id`,
    /// verifiable against the transaction's `eh` and the entry digest.
    pub fn inclusion_proof(&self, tx_id: u64, entry_index: u32) -> Result<InclusionProof> {
        let mut tx = Tx::new();
        self.read_tx(tx_id, &mut tx)?;
        if entry_index >= tx.header.nentries {
            return Err(Error::IllegalArguments("entry_index"));
        }
        Ok(tx.build_htree()?.inclusion_proof(entry_index)?)
    }

    /// The linear ALH proof `[alh(from), inner(from+1), …, inner(to)]`.
    pub fn linear_proof(&self, from_id: u64, to_id: u64) -> Result<LinearProof> {
        self.check_open()?;
        let state = self.state.lock();
        self.linear_proof_locked(&state, from_id, to_id)
    }

    fn linear_proof_locked(
        &self,
        state: &CommitState,
        from_id: u64,
        to_id: u64,
    ) -> Result<LinearProof> {
        if from_id == 0 || from_id > to_id {
            return Err(Error::IllegalArguments("from_id"));
        }
        if to_id > state.ntx {
            return Err(Error::TxNotFound(to_id));
        }
        if to_id - from_id + 1 > self.opts.max_linear_proof_len {
            return Err(Error::MaxLinearProofLenExceeded);
        }

        let mut terms = Vec::with_capacity((to_id - from_id + 1) as usize);
        terms.push(state.alhs[from_id as usize - 1]);

        let mut tx = Tx::new();
        let mut buf = Vec::new();
        for id in (from_id + 1)..=to_id {
            read_tx_at(
                self.clog.as_ref(),
                self.txlog.as_ref(),
                id,
                &mut buf,
                &mut tx,
                state.prev_alh_of(id),
            )?;
            terms.push(tx.header.inner_hash());
        }

        Ok(LinearProof {
            source_id: from_id,
            terms,
        })
    }

    /// The dual (tree + bounded linear tail) proof between two committed
    /// transactions, `source_id <= target_id`.
    ///
    /// A span whose linear tail would exceed `max_linear_proof_len` is
    /// rejected with [`Error::MaxLinearProofLenExceeded`]; callers needing
    /// longer jumps can chain bounded proofs through intermediate ids.
    pub fn dual_proof(&self, source_id: u64, target_id: u64) -> Result<DualProof> {
        self.check_open()?;
        if source_id == 0 || source_id > target_id {
            return Err(Error::IllegalArguments("source_id"));
        }

        let state = self.state.lock();
        if target_id > state.ntx {
            return Err(Error::TxNotFound(target_id));
        }

        let source = self.header_of(&state, source_id)?;
        let target = self.header_of(&state, target_id)?;

        let inclusion_proof = if source_id <= target.bl_tx_id {
            state.aht.inclusion_proof(source_id - 1, target.bl_tx_id)?
        } else {
            Vec::new()
        };
        let consistency_proof = if source.bl_tx_id > 0 {
            state.aht.consistency_proof(source.bl_tx_id, target.bl_tx_id)?
        } else {
            Vec::new()
        };
        let (target_bl_alh, last_inclusion_proof) = if target.bl_tx_id > 0 {
            (
                state.alhs[target.bl_tx_id as usize - 1],
                state.aht.inclusion_proof(target.bl_tx_id - 1, target.bl_tx_id)?,
            )
        } else {
            ([0u8; 32], Vec::new())
        };

        let linear_from = if source_id <= target.bl_tx_id {
            target.bl_tx_id
        } else {
            source_id
        };
        let linear_proof = self.linear_proof_locked(&state, linear_from, target_id)?;

        Ok(DualProof {
            source,
            target,
            inclusion_proof,
            consistency_proof,
            target_bl_alh,
            last_inclusion_proof,
            linear_proof,
        })
    }

    fn header_of(&self, state: &CommitState, id: u64) -> Result<TxHeader> {
        let mut tx = Tx::new();
        let mut buf = Vec::new();
        read_tx_at(
            self.clog.as_ref(),
            self.txlog.as_ref(),
            id,
            &mut buf,
            &mut tx,
            state.prev_alh_of(id),
        )?;
        Ok(tx.header)
    }

    /// A snapshot of the secondary index at its current integration point.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.check_open()?;
        Ok(Snapshot {
            inner: self.index.tree.snapshot()?,
        })
    }

    /// Last indexed tx id, plus the indexer's first error if it stopped.
    pub fn index_info(&self) -> Result<IndexInfo> {
        self.check_open()?;
        let ts = self.index.tree.ts()?;
        let error = self.index.ctl.state.lock().error.clone();
        Ok(IndexInfo { ts, error })
    }

    /// Flush and fsync the three logs. A no-op when nothing was written
    /// since the last call.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }
        for vlog in &self.vlogs {
            vlog.sync()?;
        }
        self.txlog.sync()?;
        self.clog.sync()?;
        Ok(())
    }

    /// Drain in-flight commits, stop the indexer (which finishes whatever
    /// is already committed and checkpoints the tree), flush everything
    /// and release the directory lock.
    pub fn close(&self) -> Result<()> {
        {
            let mut gate = self.gate.lock();
            if gate.closed {
                return Err(Error::AlreadyClosed);
            }
            gate.closed = true;
            while gate.in_flight > 0 {
                self.gate_cv.wait(&mut gate);
            }
        }

        self.index.ctl.shutdown();
        if let Some(handle) = self.index.handle.lock().take() {
            if handle.join().is_err() {
                warn!("indexer thread panicked");
            }
        }
        self.index.tree.close()?;

        {
            let mut pool = self.io.lock();
            pool.senders.clear();
            for handle in pool.handles.drain(..) {
                if handle.join().is_err() {
                    warn!("value-log worker panicked");
                }
            }
        }

        if !self.opts.read_only {
            for vlog in &self.vlogs {
                vlog.sync()?;
            }
            self.txlog.sync()?;
            self.clog.sync()?;
        }
        for vlog in &self.vlogs {
            vlog.close()?;
        }
        self.txlog.close()?;
        self.clog.close()?;

        // Releases the advisory lock, letting another opener in.
        self.lock_file.lock().take();

        debug!("store closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.gate.lock().closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }
}

/// Rebuild the in-memory commit state from the three logs, truncating torn
/// tails.
///
/// The commit log is the source of truth: its size is rounded down to
/// whole records, and trailing records pointing past the end of the tx log
/// are dropped (a crash can persist the commit log ahead of the tx log
/// when running unsynced). The surviving transactions are then replayed to
/// rebuild the binary-linking tree and the ALH chain; the replay also
/// yields, per value log, the highest offset any committed transaction
/// references, and each value log is truncated to its own high-water mark.
/// Because the replay sees every committed transaction, no committed byte
/// can be discarded, regardless of how commits interleaved across logs.
fn recover(
    vlogs: &[Arc<dyn Appendable>],
    txlog: &dyn Appendable,
    clog: &dyn Appendable,
    opts: &Options,
) -> Result<CommitState> {
    let clog_size = clog.size()?;
    if clog_size % COMMIT_RECORD_LEN != 0 {
        warn!(
            "commit log: discarding {} torn trailing bytes",
            clog_size % COMMIT_RECORD_LEN
        );
    }
    let mut ntx = clog_size / COMMIT_RECORD_LEN;

    let txlog_size = txlog.size()?;
    let mut tx_end = 0;
    while ntx > 0 {
        let (txoff, txsize) = commit_record(clog, ntx)
            .map_err(|e| Error::CorruptedCommitLog(format!("record {ntx} is unreadable: {e}")))?;
        if txoff + txsize <= txlog_size {
            tx_end = txoff + txsize;
            break;
        }
        warn!("commit record {ntx} points past the tx log, dropping it");
        ntx -= 1;
    }
    if !opts.read_only && ntx * COMMIT_RECORD_LEN != clog_size {
        clog.set_offset(ntx * COMMIT_RECORD_LEN)?;
    }

    let mut state = CommitState {
        ntx,
        alhs: Vec::with_capacity(ntx as usize),
        aht: AHTree::new(),
    };
    let mut vlog_hwm = vec![0u64; vlogs.len()];
    let mut tx = Tx::new();
    let mut buf = Vec::new();
    let mut prev_alh = [0u8; 32];

    for id in 1..=ntx {
        read_tx_at(clog, txlog, id, &mut buf, &mut tx, prev_alh)?;
        if tx.header.bl_tx_id != id - 1 || tx.header.bl_root != state.aht.root() {
            return Err(Error::CorruptedTxData(format!(
                "tx {id} embeds an inconsistent binary-linking tree snapshot"
            )));
        }

        for entry in &tx.entries {
            if entry.value_len == 0 {
                continue;
            }
            let vlog = vlog_hwm
                .get_mut(entry.vlog_id as usize)
                .ok_or_else(|| Error::CorruptedTxData(format!("tx {id} references unknown value log")))?;
            *vlog = (*vlog).max(entry.voff + entry.value_len as u64);
        }

        let alh = tx.header.alh();
        state.aht.append(&alh);
        state.alhs.push(alh);
        prev_alh = alh;
    }

    if !opts.read_only {
        if txlog_size > tx_end {
            warn!("tx log: discarding {} torn trailing bytes", txlog_size - tx_end);
            txlog.set_offset(tx_end)?;
        }
        for (i, vlog) in vlogs.iter().enumerate() {
            let size = vlog.size()?;
            if vlog_hwm[i] > size {
                return Err(Error::CorruptedTxData(format!(
                    "value log {i} is missing committed bytes ({} < {})",
                    size, vlog_hwm[i]
                )));
            }
            if vlog_hwm[i] < size {
                warn!(
                    "value log {i}: discarding {} uncommitted trailing bytes",
                    size - vlog_hwm[i]
                );
                vlog.set_offset(vlog_hwm[i])?;
            }
        }
    }

    Ok(state)
}

fn acquire_dir_lock(path: &Path) -> Result<File> {
    let lock_path = path.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("store directory is locked: {}", path.display()),
        ))
    })?;
    Ok(file)
}

fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        fs::DirBuilder::new().recursive(true).mode(mode).create(dir)?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn log_appendable_opts(opts: &Options) -> AppendableOptions {
    AppendableOptions {
        read_only: opts.read_only,
        file_mode: opts.file_mode,
        file_size: opts.file_size,
        max_opened_files: opts.max_opened_files,
        ..AppendableOptions::default()
    }
}

/// Limits recorded in the tx log's metadata blob at creation time.
fn encode_limits(opts: &Options) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&opts.max_tx_entries.to_be_bytes());
    buf.extend_from_slice(&opts.max_key_len.to_be_bytes());
    buf.extend_from_slice(&opts.max_value_len.to_be_bytes());
    buf
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
