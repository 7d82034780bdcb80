//! Immutable point-in-time views of the tree.

use std::sync::Arc;

use ledgerkv_appendable::Appendable;

use crate::node::{read_history_header, LeafValue, Link, Node, NodeKind};
use crate::{Error, Result};

/// A read-only view of the tree as of `ts` (the last tx id integrated when
/// the snapshot was taken).
///
/// The snapshot holds `Arc` references to the resident part of its root's
/// subtree; stored nodes are read through the appendable on demand. Writers
/// path-copy, so nothing the snapshot can reach is ever mutated, and the
/// references keep shared nodes alive until [`Snapshot::close`] (or drop).
pub struct Snapshot {
    root: Option<Link>,
    ts: u64,
    nodes: Arc<dyn Appendable>,
    closed: bool,
}

impl Snapshot {
    pub(crate) fn new(root: Option<Link>, ts: u64, nodes: Arc<dyn Appendable>) -> Self {
        Self {
            root,
            ts,
            nodes,
            closed: false,
        }
    }

    /// The tx id this snapshot is consistent with.
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// The newest value for `key` and the tx id that wrote it.
    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, u64)> {
        let lv = self.find(key)?;
        Ok((lv.value, lv.ts))
    }

    /// Tx ids that wrote `key`, newest first, at most `limit` of them.
    pub fn get_ts(&self, key: &[u8], limit: usize) -> Result<Vec<u64>> {
        if limit == 0 {
            return Err(Error::IllegalArguments("limit"));
        }
        let lv = self.find(key)?;

        let mut out = Vec::with_capacity(limit.min(1 + lv.pending.len()));
        out.push(lv.ts);
        for (ts, _) in lv.pending.iter().rev() {
            if out.len() == limit {
                return Ok(out);
            }
            out.push(*ts);
        }

        let mut off = lv.hoff;
        while off != 0 && out.len() < limit {
            let (prev, ts) = read_history_header(self.nodes.as_ref(), off)?;
            out.push(ts);
            off = prev;
        }
        Ok(out)
    }

    /// Release the node references. Further reads fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.root = None;
        self.closed = true;
        Ok(())
    }

    fn find(&self, key: &[u8]) -> Result<LeafValue> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if key.is_empty() {
            return Err(Error::IllegalArguments("key"));
        }

        let Some(root) = &self.root else {
            return Err(Error::KeyNotFound);
        };
        let mut node: Arc<Node> = root.resolve(self.nodes.as_ref())?;
        loop {
            match &node.kind {
                NodeKind::Inner { children } => {
                    let idx = children.partition_point(|c| c.max_key.as_slice() < key);
                    if idx == children.len() {
                        return Err(Error::KeyNotFound);
                    }
                    let next = children[idx].link.resolve(self.nodes.as_ref())?;
                    node = next;
                }
                NodeKind::Leaf { entries } => {
                    return match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                        Ok(i) => Ok(entries[i].value.clone()),
                        Err(_) => Err(Error::KeyNotFound),
                    };
                }
            }
        }
    }
}
