//! Transaction model and its canonical on-disk encoding.
//!
//! A tx-log record is the header followed by one fixed-shape record per
//! entry; it is not self-delimiting and is located through the commit log.
//! All integers are big-endian.

use ledgerkv_merkle::htree::HTree;
use ledgerkv_merkle::Digest;
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// One key/value pair submitted to [`crate::Store::commit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KV {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KV {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// What [`crate::Store::commit`] returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxSummary {
    pub id: u64,
    pub ts: u64,
    pub alh: Digest,
    pub nentries: u32,
}

/// id(8) ‖ ts(8) ‖ bl_tx_id(8) ‖ bl_root(32) ‖ nentries(4).
pub(crate) const TX_HEADER_LEN: usize = 8 + 8 + 8 + 32 + 4;

/// key_len(4) ‖ value_len(4) ‖ vlog_id(1) ‖ voff(8) ‖ hvalue(32), plus the key.
pub(crate) const TX_ENTRY_FIXED_LEN: usize = 4 + 4 + 1 + 8 + 32;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxHeader {
    pub id: u64,
    /// Commit wall-clock seconds. Recorded, not used for ordering.
    pub ts: u64,
    /// Last transaction covered by the embedded binary-linking tree.
    pub bl_tx_id: u64,
    pub bl_root: Digest,
    pub nentries: u32,
    /// Root of the per-transaction Merkle tree over entry digests.
    pub eh: Digest,
    /// ALH of the preceding transaction; all zeroes for the first.
    pub prev_alh: Digest,
}

impl TxHeader {
    /// Commitment to the header fields: `SHA-256(id ‖ ts ‖ bl_tx_id ‖
    /// bl_root ‖ nentries ‖ eh)`.
    pub fn inner_hash(&self) -> Digest {
        let mut h = Sha256::new();
        h.update(self.id.to_be_bytes());
        h.update(self.ts.to_be_bytes());
        h.update(self.bl_tx_id.to_be_bytes());
        h.update(self.bl_root);
        h.update(self.nentries.to_be_bytes());
        h.update(self.eh);
        h.finalize().into()
    }

    /// `SHA-256(prev_alh ‖ inner_hash)`, binding this transaction to all
    /// its predecessors.
    pub fn alh(&self) -> Digest {
        let mut h = Sha256::new();
        h.update(self.prev_alh);
        h.update(self.inner_hash());
        h.finalize().into()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxEntry {
    pub key: Vec<u8>,
    pub value_len: u32,
    /// Which value log holds the bytes.
    pub vlog_id: u8,
    /// Logical offset within that value log.
    pub voff: u64,
    /// SHA-256 of the value bytes.
    pub hvalue: Digest,
}

impl TxEntry {
    /// Leaf input of the per-transaction Merkle tree:
    /// `SHA-256(key ‖ value_len ‖ hvalue)`.
    pub fn digest(&self) -> Digest {
        let mut h = Sha256::new();
        h.update(&self.key);
        h.update(self.value_len.to_be_bytes());
        h.update(self.hvalue);
        h.finalize().into()
    }

    pub fn value_ref(&self) -> ValueRef {
        ValueRef {
            value_len: self.value_len,
            vlog_id: self.vlog_id,
            voff: self.voff,
            hvalue: self.hvalue,
        }
    }
}

/// Locator of a committed value: enough to read and verify the bytes
/// without the transaction record. This is what the secondary index stores
/// per key version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueRef {
    pub value_len: u32,
    pub vlog_id: u8,
    pub voff: u64,
    pub hvalue: Digest,
}

pub(crate) const VALUE_REF_LEN: usize = 4 + 1 + 8 + 32;

impl ValueRef {
    pub(crate) fn encode(&self) -> [u8; VALUE_REF_LEN] {
        let mut buf = [0u8; VALUE_REF_LEN];
        buf[..4].copy_from_slice(&self.value_len.to_be_bytes());
        buf[4] = self.vlog_id;
        buf[5..13].copy_from_slice(&self.voff.to_be_bytes());
        buf[13..].copy_from_slice(&self.hvalue);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VALUE_REF_LEN {
            return Err(Error::CorruptedTxData("bad value reference length".into()));
        }
        Ok(Self {
            value_len: u32::from_be_bytes(buf[..4].try_into().unwrap()),
            vlog_id: buf[4],
            voff: u64::from_be_bytes(buf[5..13].try_into().unwrap()),
            hvalue: buf[13..].try_into().unwrap(),
        })
    }
}

/// A decoded transaction. Allocate once with [`crate::Store::new_tx`] and
/// reuse across [`crate::Store::read_tx`] calls; decoding clears and
/// refills the entry buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tx {
    pub header: TxHeader,
    pub entries: Vec<TxEntry>,
}

impl Tx {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `key`. Entries are sorted by key at commit time.
    pub fn entry(&self, key: &[u8]) -> Result<&TxEntry> {
        self.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .map(|i| &self.entries[i])
            .map_err(|_| Error::KeyNotFound)
    }

    /// Rebuild the per-transaction Merkle tree over the entry digests.
    pub fn build_htree(&self) -> Result<HTree> {
        let digests: Vec<Digest> = self.entries.iter().map(|e| e.digest()).collect();
        Ok(HTree::new(&digests)?)
    }

    /// Parse a tx-log record into `self`, reusing allocations. `prev_alh`
    /// is not part of the record and must be supplied by the caller;
    /// `header.eh` is recomputed from the entries.
    pub(crate) fn decode(&mut self, buf: &[u8], prev_alh: Digest) -> Result<()> {
        let mut cur = Cursor { buf, pos: 0 };

        self.header.id = cur.u64()?;
        self.header.ts = cur.u64()?;
        self.header.bl_tx_id = cur.u64()?;
        self.header.bl_root = cur.digest()?;
        self.header.nentries = cur.u32()?;
        self.header.prev_alh = prev_alh;

        self.entries.clear();
        self.entries.reserve(self.header.nentries as usize);
        for _ in 0..self.header.nentries {
            let key_len = cur.u32()? as usize;
            let key = cur.take(key_len)?.to_vec();
            let value_len = cur.u32()?;
            let vlog_id = cur.u8()?;
            let voff = cur.u64()?;
            let hvalue = cur.digest()?;
            self.entries.push(TxEntry {
                key,
                value_len,
                vlog_id,
                voff,
                hvalue,
            });
        }
        if cur.pos != buf.len() {
            return Err(Error::CorruptedTxData(format!(
                "trailing bytes in tx {} record",
                self.header.id
            )));
        }

        self.header.eh = self.build_htree()?.root();
        Ok(())
    }
}

/// Serialize the entries section of a tx-log record.
pub(crate) fn encode_entries(entries: &[TxEntry]) -> Vec<u8> {
    let len: usize = entries
        .iter()
        .map(|e| TX_ENTRY_FIXED_LEN + e.key.len())
        .sum();
    let mut buf = Vec::with_capacity(len);
    for entry in entries {
        buf.extend_from_slice(&(entry.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&entry.key);
        buf.extend_from_slice(&entry.value_len.to_be_bytes());
        buf.push(entry.vlog_id);
        buf.extend_from_slice(&entry.voff.to_be_bytes());
        buf.extend_from_slice(&entry.hvalue);
    }
    buf
}

/// Serialize a tx-log record header.
pub(crate) fn encode_header(header: &TxHeader) -> [u8; TX_HEADER_LEN] {
    let mut buf = [0u8; TX_HEADER_LEN];
    buf[..8].copy_from_slice(&header.id.to_be_bytes());
    buf[8..16].copy_from_slice(&header.ts.to_be_bytes());
    buf[16..24].copy_from_slice(&header.bl_tx_id.to_be_bytes());
    buf[24..56].copy_from_slice(&header.bl_root);
    buf[56..].copy_from_slice(&header.nentries.to_be_bytes());
    buf
}

pub(crate) fn hash_value(value: &[u8]) -> Digest {
    Sha256::digest(value).into()
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::CorruptedTxData("truncated tx record".into()));
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

    fn digest(&mut self) -> Result<Digest> {
        Ok(self.take(32)?.try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_tx() -> Tx {
        let entries = vec![
            TxEntry {
                key: b"alpha".to_vec(),
                value_len: 3,
                vlog_id: 0,
                voff: 0,
                hvalue: hash_value(b"one"),
            },
            TxEntry {
                key: b"beta".to_vec(),
                value_len: 0,
                vlog_id: 0,
                voff: 0,
                hvalue: hash_value(b""),
            },
        ];
        let mut tx = Tx {
            header: TxHeader {
                id: 7,
                ts: 1_700_000_000,
                bl_tx_id: 6,
                bl_root: [9u8; 32],
                nentries: entries.len() as u32,
                eh: [0u8; 32],
                prev_alh: [3u8; 32],
            },
            entries,
        };
        tx.header.eh = tx.build_htree().unwrap().root();
        tx
    }

    #[test]
    fn record_roundtrip() {
        let tx = sample_tx();
        let mut record = encode_header(&tx.header).to_vec();
        record.extend_from_slice(&encode_entries(&tx.entries));

        let mut decoded = Tx::new();
        decoded.decode(&record, tx.header.prev_alh).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn decode_rejects_truncation_and_trailing_bytes() {
        let tx = sample_tx();
        let mut record = encode_header(&tx.header).to_vec();
        record.extend_from_slice(&encode_entries(&tx.entries));

        let mut decoded = Tx::new();
        assert!(decoded.decode(&record[..record.len() - 1], [0u8; 32]).is_err());

        record.push(0);
        assert!(decoded.decode(&record, [0u8; 32]).is_err());
    }

    #[test]
    fn alh_chains_over_inner_hashes() {
        let tx = sample_tx();
        let mut h = Sha256::new();
        h.update(tx.header.prev_alh);
        h.update(tx.header.inner_hash());
        let expected: Digest = h.finalize().into();
        assert_eq!(tx.header.alh(), expected);
    }

    #[test]
    fn value_ref_roundtrip() {
        let vref = ValueRef {
            value_len: 42,
            vlog_id: 3,
            voff: 1 << 40,
            hvalue: [0xab; 32],
        };
        assert_eq!(ValueRef::decode(&vref.encode()).unwrap(), vref);
    }

    #[test]
    fn entry_lookup_is_by_key() {
        let tx = sample_tx();
        assert_eq!(tx.entry(b"alpha").unwrap().value_len, 3);
        assert_eq!(tx.entry(b"beta").unwrap().value_len, 0);
        assert!(matches!(tx.entry(b"gamma"), Err(Error::KeyNotFound)));
    }
}
