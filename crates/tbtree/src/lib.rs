//! Durable copy-on-write B+ tree.
//!
//! The tree maps keys to small opaque values plus the full history of tx
//! ids that wrote each key. Every mutation path-copies from the affected
//! leaf to the root, so concurrently open [`Snapshot`]s keep observing the
//! tree they captured. Dirty nodes live in memory until [`TBTree::flush`]
//! appends them to the backing nodes appendable and records the new root
//! offset in a small root log, which is the recovery anchor: reopening
//! resumes from the latest root whose nodes are intact.

use std::sync::Arc;

use ledgerkv_appendable::Appendable;
use log::{debug, warn};
use parking_lot::RwLock;

mod error;
mod node;
mod snapshot;

pub use error::Error;
pub use snapshot::Snapshot;

use node::{read_node, write_history_record, ChildRef, LeafEntry, LeafValue, Link, Node, NodeKind};

pub type Result<T> = std::result::Result<T, Error>;

/// Stamped at the start of an empty nodes appendable so that offset 0
/// never addresses a node or history record.
const NODES_MARKER: &[u8; 4] = b"TBT1";

/// root_off(8) ‖ ts(8).
const ROOT_RECORD_LEN: u64 = 16;

pub const DEFAULT_MAX_NODE_ENTRIES: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Split threshold: maximum number of entries in a leaf and children
    /// in an inner node.
    pub max_node_entries: usize,
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_node_entries: DEFAULT_MAX_NODE_ENTRIES,
            read_only: false,
        }
    }
}

pub struct TBTree {
    nodes: Arc<dyn Appendable>,
    roots: Arc<dyn Appendable>,
    max_node_entries: usize,
    read_only: bool,
    state: RwLock<TreeState>,
}

struct TreeState {
    root: Option<Link>,
    /// Last tx id integrated into the tree.
    ts: u64,
    closed: bool,
}

struct Split {
    left_max: Vec<u8>,
    right_max: Vec<u8>,
    right: Link,
}

impl TBTree {
    /// Open the tree over its two appendables: `nodes` (pages and history
    /// records) and `roots` (fixed 16-byte checkpoint records).
    ///
    /// The latest root record whose node offset is intact wins; trailing
    /// records past that point are truncated away.
    pub fn open(nodes: Arc<dyn Appendable>, roots: Arc<dyn Appendable>, opts: Options) -> Result<Self> {
        if opts.max_node_entries < 2 {
            return Err(Error::IllegalArguments("max_node_entries"));
        }

        if nodes.size()? == 0 && !opts.read_only {
            nodes.append(NODES_MARKER)?;
        }

        let roots_size = roots.size()?;
        let mut valid = roots_size / ROOT_RECORD_LEN;
        if roots_size % ROOT_RECORD_LEN != 0 {
            warn!(
                "root log: discarding {} torn trailing bytes",
                roots_size % ROOT_RECORD_LEN
            );
        }

        let nodes_size = nodes.size()?;
        let mut root = None;
        let mut ts = 0;
        while valid > 0 {
            let mut rec = [0u8; ROOT_RECORD_LEN as usize];
            ledgerkv_appendable::read_exact_at(roots.as_ref(), &mut rec, (valid - 1) * ROOT_RECORD_LEN)?;
            let off = u64::from_be_bytes(rec[..8].try_into().unwrap());
            let rec_ts = u64::from_be_bytes(rec[8..].try_into().unwrap());
            if off + 4 <= nodes_size {
                root = Some(Link::Stored { off, ts: rec_ts });
                ts = rec_ts;
                break;
            }
            warn!("root log: record {} points past the nodes log, skipping", valid - 1);
            valid -= 1;
        }

        if !opts.read_only && valid * ROOT_RECORD_LEN != roots_size {
            roots.set_offset(valid * ROOT_RECORD_LEN)?;
        }

        debug!("tbtree opened at ts {ts}");
        Ok(Self {
            nodes,
            roots,
            max_node_entries: opts.max_node_entries,
            read_only: opts.read_only,
            state: RwLock::new(TreeState {
                root,
                ts,
                closed: false,
            }),
        })
    }

    /// Last tx id integrated into the tree.
    pub fn ts(&self) -> Result<u64> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(state.ts)
    }

    /// Map `key` to `value` as of tx `ts`. A repeated key pushes the prior
    /// version onto the key's history.
    pub fn insert(&self, key: &[u8], value: &[u8], ts: u64) -> Result<()> {
        if key.is_empty() {
            return Err(Error::IllegalArguments("key"));
        }
        if ts == 0 {
            return Err(Error::IllegalArguments("ts"));
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let mut state = self.state.write();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }

        let split = if state.root.is_none() {
            state.root = Some(Link::Loaded(Arc::new(Node::new_leaf(
                key.to_vec(),
                value.to_vec(),
                ts,
            ))));
            None
        } else {
            let link = state.root.as_mut().expect("root was just checked");
            self.insert_into(link, key, value, ts)?
        };

        if let Some(split) = split {
            let old_root = state.root.take().expect("root exists after insert");
            let root_ts = old_root.ts().max(split.right.ts());
            state.root = Some(Link::Loaded(Arc::new(Node {
                ts: root_ts,
                off: None,
                dirty: true,
                kind: NodeKind::Inner {
                    children: vec![
                        ChildRef {
                            max_key: split.left_max,
                            link: old_root,
                        },
                        ChildRef {
                            max_key: split.right_max,
                            link: split.right,
                        },
                    ],
                },
            })));
        }

        state.ts = state.ts.max(ts);
        Ok(())
    }

    fn insert_into(&self, link: &mut Link, key: &[u8], value: &[u8], ts: u64) -> Result<Option<Split>> {
        if let Link::Stored { off, .. } = link {
            let loaded = read_node(self.nodes.as_ref(), *off)?;
            *link = Link::Loaded(Arc::new(loaded));
        }
        let Link::Loaded(arc) = link else { unreachable!() };
        let max_entries = self.max_node_entries;

        let node = Arc::make_mut(arc);
        node.dirty = true;
        node.ts = node.ts.max(ts);

        match &mut node.kind {
            NodeKind::Leaf { entries } => {
                match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                    Ok(i) => {
                        let lv = &mut entries[i].value;
                        let old_value = std::mem::replace(&mut lv.value, value.to_vec());
                        let old_ts = std::mem::replace(&mut lv.ts, ts);
                        lv.pending.push((old_ts, old_value));
                    }
                    Err(i) => entries.insert(
                        i,
                        LeafEntry {
                            key: key.to_vec(),
                            value: LeafValue {
                                ts,
                                value: value.to_vec(),
                                pending: Vec::new(),
                                hoff: 0,
                                hcount: 0,
                            },
                        },
                    ),
                }

                if entries.len() <= max_entries {
                    return Ok(None);
                }
                let right_entries = entries.split_off(entries.len() / 2);
                let left_max = entries.last().expect("left half is non-empty").key.clone();
                let right_max = right_entries.last().expect("right half is non-empty").key.clone();
                let right_ts = right_entries
                    .iter()
                    .map(|e| e.value.ts)
                    .max()
                    .expect("right half is non-empty");
                Ok(Some(Split {
                    left_max,
                    right_max,
                    right: Link::Loaded(Arc::new(Node {
                        ts: right_ts,
                        off: None,
                        dirty: true,
                        kind: NodeKind::Leaf {
                            entries: right_entries,
                        },
                    })),
                }))
            }
            NodeKind::Inner { children } => {
                let mut idx = children.partition_point(|c| c.max_key.as_slice() < key);
                if idx == children.len() {
                    // Key beyond the current maximum: route into the last
                    // child and widen its range.
                    idx -= 1;
                    children[idx].max_key = key.to_vec();
                }

                if let Some(split) = self.insert_into(&mut children[idx].link, key, value, ts)? {
                    children[idx].max_key = split.left_max;
                    children.insert(
                        idx + 1,
                        ChildRef {
                            max_key: split.right_max,
                            link: split.right,
                        },
                    );
                }

                if children.len() <= max_entries {
                    return Ok(None);
                }
                let right_children = children.split_off(children.len() / 2);
                let left_max = children.last().expect("left half is non-empty").max_key.clone();
                let right_max = right_children
                    .last()
                    .expect("right half is non-empty")
                    .max_key
                    .clone();
                let right_ts = right_children
                    .iter()
                    .map(|c| c.link.ts())
                    .max()
                    .expect("right half is non-empty");
                Ok(Some(Split {
                    left_max,
                    right_max,
                    right: Link::Loaded(Arc::new(Node {
                        ts: right_ts,
                        off: None,
                        dirty: true,
                        kind: NodeKind::Inner {
                            children: right_children,
                        },
                    })),
                }))
            }
        }
    }

    /// Persist all dirty nodes and append a root checkpoint. A clean tree
    /// is a no-op.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut TreeState) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let Some(root) = state.root.as_mut() else {
            return Ok(());
        };
        match root {
            Link::Stored { .. } => return Ok(()),
            Link::Loaded(node) if !node.dirty => return Ok(()),
            Link::Loaded(_) => {}
        }

        let (off, ts) = self.flush_link(root)?;
        self.nodes.sync()?;

        let mut rec = [0u8; ROOT_RECORD_LEN as usize];
        rec[..8].copy_from_slice(&off.to_be_bytes());
        rec[8..].copy_from_slice(&ts.to_be_bytes());
        self.roots.append(&rec)?;
        self.roots.sync()?;
        debug!("tbtree checkpoint: root at {off}, ts {ts}");
        Ok(())
    }

    /// Flush the subtree behind `link` bottom-up, returning its location.
    fn flush_link(&self, link: &mut Link) -> Result<(u64, u64)> {
        let arc = match link {
            Link::Stored { off, ts } => return Ok((*off, *ts)),
            Link::Loaded(arc) => arc,
        };
        if !arc.dirty {
            let off = arc
                .off
                .ok_or_else(|| Error::Corrupted("clean node has no offset".into()))?;
            return Ok((off, arc.ts));
        }

        let node = Arc::make_mut(arc);
        match &mut node.kind {
            NodeKind::Inner { children } => {
                for child in children.iter_mut() {
                    self.flush_link(&mut child.link)?;
                }
            }
            NodeKind::Leaf { entries } => {
                for entry in entries.iter_mut() {
                    let lv = &mut entry.value;
                    if lv.pending.is_empty() {
                        continue;
                    }
                    let mut prev = lv.hoff;
                    for (ts, value) in lv.pending.drain(..) {
                        prev = write_history_record(self.nodes.as_ref(), prev, ts, &value)?;
                        lv.hcount += 1;
                    }
                    lv.hoff = prev;
                }
            }
        }

        let payload = node.encode()?;
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        let (off, _) = self.nodes.append(&buf)?;

        node.off = Some(off);
        node.dirty = false;
        Ok((off, node.ts))
    }

    /// An immutable view of the tree as of the last integrated tx.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(Snapshot::new(state.root.clone(), state.ts, self.nodes.clone()))
    }

    /// Flush and close the backing appendables.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        self.flush_locked(&mut state)?;
        self.nodes.close()?;
        self.roots.close()?;
        state.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ledgerkv_appendable::{AppendFile, Options as AppendableOptions};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn open_tree(dir: &std::path::Path, max_node_entries: usize) -> TBTree {
        let nodes: Arc<dyn Appendable> = Arc::new(
            AppendFile::open(dir.join("nodes.idx"), AppendableOptions::default()).unwrap(),
        );
        let roots: Arc<dyn Appendable> = Arc::new(
            AppendFile::open(dir.join("roots.ri"), AppendableOptions::default()).unwrap(),
        );
        TBTree::open(
            nodes,
            roots,
            Options {
                max_node_entries,
                read_only: false,
            },
        )
        .unwrap()
    }

    fn key(i: u64) -> [u8; 8] {
        i.to_be_bytes()
    }

    #[test]
    fn insert_and_get_across_splits() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path(), 4);

        for i in 0..200u64 {
            tree.insert(&key(i * 7 % 200), &key(i), i + 1).unwrap();
        }
        assert_eq!(tree.ts().unwrap(), 200);

        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.ts(), 200);
        for i in 0..200u64 {
            let (value, ts) = snap.get(&key(i * 7 % 200)).unwrap();
            assert_eq!(value, key(i));
            assert_eq!(ts, i + 1);
        }
        assert!(matches!(snap.get(&key(1000)), Err(Error::KeyNotFound)));
    }

    #[test]
    fn history_spans_flushes() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path(), 4);

        for ts in 1..=10u64 {
            tree.insert(b"k", &ts.to_be_bytes(), ts).unwrap();
            if ts % 3 == 0 {
                tree.flush().unwrap();
            }
        }

        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.get_ts(b"k", 100).unwrap(), (1..=10u64).rev().collect::<Vec<_>>());
        assert_eq!(snap.get_ts(b"k", 4).unwrap(), vec![10, 9, 8, 7]);
        let (value, ts) = snap.get(b"k").unwrap();
        assert_eq!(value, 10u64.to_be_bytes());
        assert_eq!(ts, 10);
    }

    #[test]
    fn reopen_resumes_from_last_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let tree = open_tree(dir.path(), 4);
            for i in 0..50u64 {
                tree.insert(&key(i), &key(i + 1000), i + 1).unwrap();
            }
            tree.close().unwrap();
        }

        let tree = open_tree(dir.path(), 4);
        assert_eq!(tree.ts().unwrap(), 50);
        let snap = tree.snapshot().unwrap();
        for i in 0..50u64 {
            let (value, ts) = snap.get(&key(i)).unwrap();
            assert_eq!(value, key(i + 1000));
            assert_eq!(ts, i + 1);
        }
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path(), 4);

        tree.insert(b"a", b"v1", 1).unwrap();
        let s1 = tree.snapshot().unwrap();

        tree.insert(b"a", b"v2", 2).unwrap();
        tree.insert(b"b", b"w", 3).unwrap();
        let s2 = tree.snapshot().unwrap();

        assert_eq!(s1.ts(), 1);
        assert_eq!(s1.get(b"a").unwrap(), (b"v1".to_vec(), 1));
        assert!(matches!(s1.get(b"b"), Err(Error::KeyNotFound)));

        assert_eq!(s2.ts(), 3);
        assert_eq!(s2.get(b"a").unwrap(), (b"v2".to_vec(), 2));
        assert_eq!(s2.get(b"b").unwrap(), (b"w".to_vec(), 3));
    }

    #[test]
    fn snapshot_survives_later_flushes_and_writes() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path(), 4);

        for i in 0..20u64 {
            tree.insert(&key(i), b"v", i + 1).unwrap();
        }
        let snap = tree.snapshot().unwrap();
        tree.flush().unwrap();
        for i in 20..40u64 {
            tree.insert(&key(i), b"v", i + 1).unwrap();
        }

        // The snapshot still sees exactly its 20 keys.
        assert_eq!(snap.ts(), 20);
        assert!(snap.get(&key(5)).is_ok());
        assert!(matches!(snap.get(&key(30)), Err(Error::KeyNotFound)));
    }

    #[test]
    fn closed_tree_rejects_operations() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path(), 4);
        tree.insert(b"a", b"v", 1).unwrap();
        tree.close().unwrap();

        assert!(matches!(tree.insert(b"b", b"v", 2), Err(Error::AlreadyClosed)));
        assert!(matches!(tree.snapshot(), Err(Error::AlreadyClosed)));
        assert!(matches!(tree.ts(), Err(Error::AlreadyClosed)));
        assert!(matches!(tree.close(), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn torn_root_log_falls_back_to_previous_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let tree = open_tree(dir.path(), 4);
            tree.insert(b"a", b"v1", 1).unwrap();
            tree.flush().unwrap();
            tree.insert(b"a", b"v2", 2).unwrap();
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        // Tear the last root record in half.
        {
            let roots = AppendFile::open(dir.path().join("roots.ri"), AppendableOptions::default()).unwrap();
            let size = roots.size().unwrap();
            roots.set_offset(size - 8).unwrap();
            roots.close().unwrap();
        }

        let tree = open_tree(dir.path(), 4);
        assert_eq!(tree.ts().unwrap(), 1);
        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.get(b"a").unwrap(), (b"v1".to_vec(), 1));
    }
}
