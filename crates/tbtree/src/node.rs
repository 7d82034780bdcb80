//! Tree nodes and their on-disk encoding.
//!
//! Nodes are immutable once shared: the writer path-copies via
//! [`std::sync::Arc::make_mut`], so a snapshot holding the old `Arc` keeps
//! the old version alive. Once flushed, a node is addressable by its offset
//! in the backing appendable; children reference each other by offset, which
//! breaks reference cycles by construction.

use std::sync::Arc;

use ledgerkv_appendable::{read_exact_at, Appendable};

use crate::{Error, Result};

const LEAF_TAG: u8 = 1;
const INNER_TAG: u8 = 2;

/// A history record on disk: `prev_off(8) ‖ ts(8) ‖ value_len(4) ‖ value`.
/// `prev_off == 0` terminates the chain; offset 0 never holds a record
/// because the tree stamps a 4-byte marker at the start of an empty nodes
/// appendable.
pub(crate) const HISTORY_HEADER_LEN: usize = 8 + 8 + 4;

/// Reference to a child or root node: either resident or by offset.
#[derive(Debug, Clone)]
pub enum Link {
    Loaded(Arc<Node>),
    Stored { off: u64, ts: u64 },
}

impl Link {
    /// Timestamp (max tx id) of the referenced subtree.
    pub fn ts(&self) -> u64 {
        match self {
            Link::Loaded(node) => node.ts,
            Link::Stored { ts, .. } => *ts,
        }
    }

    /// Offset and ts of the already-flushed node behind this link.
    pub(crate) fn location(&self) -> Result<(u64, u64)> {
        match self {
            Link::Stored { off, ts } => Ok((*off, *ts)),
            Link::Loaded(node) => {
                let off = node
                    .off
                    .ok_or_else(|| Error::Corrupted("unflushed node has no offset".into()))?;
                Ok((off, node.ts))
            }
        }
    }

    /// Resolve to a resident node, reading through `nodes` if stored.
    pub(crate) fn resolve(&self, nodes: &dyn Appendable) -> Result<Arc<Node>> {
        match self {
            Link::Loaded(node) => Ok(node.clone()),
            Link::Stored { off, .. } => read_node(nodes, *off).map(Arc::new),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Max tx id that touched this subtree.
    pub ts: u64,
    /// Offset in the nodes appendable, once flushed.
    pub(crate) off: Option<u64>,
    /// Re-serialize on the next flush.
    pub(crate) dirty: bool,
    pub(crate) kind: NodeKind,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Inner { children: Vec<ChildRef> },
    Leaf { entries: Vec<LeafEntry> },
}

/// Child pointer of an inner node. `max_key` is the largest key in the
/// child's subtree; routing picks the first child whose `max_key` is not
/// below the lookup key.
#[derive(Debug, Clone)]
pub(crate) struct ChildRef {
    pub max_key: Vec<u8>,
    pub link: Link,
}

#[derive(Debug, Clone)]
pub(crate) struct LeafEntry {
    pub key: Vec<u8>,
    pub value: LeafValue,
}

#[derive(Debug, Clone)]
pub(crate) struct LeafValue {
    /// Tx id of the newest version.
    pub ts: u64,
    pub value: Vec<u8>,
    /// Prior versions not yet flushed, oldest first.
    pub pending: Vec<(u64, Vec<u8>)>,
    /// Offset of the newest on-disk history record, 0 if none.
    pub hoff: u64,
    /// Number of versions already on disk.
    pub hcount: u64,
}

impl Node {
    pub(crate) fn new_leaf(key: Vec<u8>, value: Vec<u8>, ts: u64) -> Self {
        Node {
            ts,
            off: None,
            dirty: true,
            kind: NodeKind::Leaf {
                entries: vec![LeafEntry {
                    key,
                    value: LeafValue {
                        ts,
                        value,
                        pending: Vec::new(),
                        hoff: 0,
                        hcount: 0,
                    },
                }],
            },
        }
    }

    pub(crate) fn children(&self) -> Option<&[ChildRef]> {
        match &self.kind {
            NodeKind::Inner { children } => Some(children),
            NodeKind::Leaf { .. } => None,
        }
    }

    pub(crate) fn entries(&self) -> Option<&[LeafEntry]> {
        match &self.kind {
            NodeKind::Leaf { entries } => Some(entries),
            NodeKind::Inner { .. } => None,
        }
    }

    /// Serialize for the nodes appendable. Children and pending history
    /// must have been flushed already (links resolvable to offsets, empty
    /// `pending`).
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match &self.kind {
            NodeKind::Leaf { entries } => {
                buf.push(LEAF_TAG);
                buf.extend_from_slice(&self.ts.to_be_bytes());
                buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for entry in entries {
                    debug_assert!(entry.value.pending.is_empty());
                    buf.extend_from_slice(&(entry.key.len() as u32).to_be_bytes());
                    buf.extend_from_slice(&entry.key);
                    buf.extend_from_slice(&entry.value.ts.to_be_bytes());
                    buf.extend_from_slice(&(entry.value.value.len() as u32).to_be_bytes());
                    buf.extend_from_slice(&entry.value.value);
                    buf.extend_from_slice(&entry.value.hoff.to_be_bytes());
                    buf.extend_from_slice(&entry.value.hcount.to_be_bytes());
                }
            }
            NodeKind::Inner { children } => {
                buf.push(INNER_TAG);
                buf.extend_from_slice(&self.ts.to_be_bytes());
                buf.extend_from_slice(&(children.len() as u32).to_be_bytes());
                for child in children {
                    let (off, ts) = child.link.location()?;
                    buf.extend_from_slice(&(child.max_key.len() as u32).to_be_bytes());
                    buf.extend_from_slice(&child.max_key);
                    buf.extend_from_slice(&off.to_be_bytes());
                    buf.extend_from_slice(&ts.to_be_bytes());
                }
            }
        }
        Ok(buf)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Corrupted("truncated node".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Read and decode the node whose length prefix sits at `off`.
pub(crate) fn read_node(nodes: &dyn Appendable, off: u64) -> Result<Node> {
    let mut len_buf = [0u8; 4];
    read_exact_at(nodes, &mut len_buf, off)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    read_exact_at(nodes, &mut buf, off + 4)?;
    let mut cur = Cursor { buf: &buf, pos: 0 };

    let tag = cur.u8()?;
    let ts = cur.u64()?;
    let n = cur.u32()? as usize;
    let kind = match tag {
        LEAF_TAG => {
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                let key_len = cur.u32()? as usize;
                let key = cur.take(key_len)?.to_vec();
                let value_ts = cur.u64()?;
                let value_len = cur.u32()? as usize;
                let value = cur.take(value_len)?.to_vec();
                let hoff = cur.u64()?;
                let hcount = cur.u64()?;
                entries.push(LeafEntry {
                    key,
                    value: LeafValue {
                        ts: value_ts,
                        value,
                        pending: Vec::new(),
                        hoff,
                        hcount,
                    },
                });
            }
            NodeKind::Leaf { entries }
        }
        INNER_TAG => {
            let mut children = Vec::with_capacity(n);
            for _ in 0..n {
                let key_len = cur.u32()? as usize;
                let max_key = cur.take(key_len)?.to_vec();
                let off = cur.u64()?;
                let child_ts = cur.u64()?;
                children.push(ChildRef {
                    max_key,
                    link: Link::Stored { off, ts: child_ts },
                });
            }
            NodeKind::Inner { children }
        }
        other => return Err(Error::Corrupted(format!("unknown node tag: {other}"))),
    };

    Ok(Node {
        ts,
        off: Some(off),
        dirty: false,
        kind,
    })
}

/// Append one history record, returning its offset.
pub(crate) fn write_history_record(
    nodes: &dyn Appendable,
    prev_off: u64,
    ts: u64,
    value: &[u8],
) -> Result<u64> {
    let mut buf = Vec::with_capacity(HISTORY_HEADER_LEN + value.len());
    buf.extend_from_slice(&prev_off.to_be_bytes());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    let (off, _) = nodes.append(&buf)?;
    Ok(off)
}

/// Read the `(prev_off, ts)` header of the history record at `off`.
pub(crate) fn read_history_header(nodes: &dyn Appendable, off: u64) -> Result<(u64, u64)> {
    let mut buf = [0u8; 16];
    read_exact_at(nodes, &mut buf, off)?;
    let prev_off = u64::from_be_bytes(buf[..8].try_into().unwrap());
    let ts = u64::from_be_bytes(buf[8..].try_into().unwrap());
    Ok((prev_off, ts))
}
