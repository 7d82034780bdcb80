//! Streaming access to committed transactions.

use std::sync::Arc;

use ledgerkv_appendable::{read_exact_at, Appendable};
use ledgerkv_merkle::Digest;

use crate::tx::Tx;
use crate::{Error, Result};

/// One commit-log record: tx_log_offset(8) ‖ tx_record_size(8).
pub(crate) const COMMIT_RECORD_LEN: u64 = 16;

/// Number of committed transactions, straight from the commit log size.
pub(crate) fn committed_count(clog: &dyn Appendable) -> Result<u64> {
    Ok(clog.size()? / COMMIT_RECORD_LEN)
}

/// The `(tx_log_offset, tx_record_size)` pair for transaction `id`.
pub(crate) fn commit_record(clog: &dyn Appendable, id: u64) -> Result<(u64, u64)> {
    let mut rec = [0u8; COMMIT_RECORD_LEN as usize];
    read_exact_at(clog, &mut rec, (id - 1) * COMMIT_RECORD_LEN)?;
    Ok((
        u64::from_be_bytes(rec[..8].try_into().unwrap()),
        u64::from_be_bytes(rec[8..].try_into().unwrap()),
    ))
}

/// Read and decode transaction `id` into `tx`, reusing `buf`. The caller
/// supplies `prev_alh` (the ALH of `id - 1`), which the record itself does
/// not carry.
pub(crate) fn read_tx_at(
    clog: &dyn Appendable,
    txlog: &dyn Appendable,
    id: u64,
    buf: &mut Vec<u8>,
    tx: &mut Tx,
    prev_alh: Digest,
) -> Result<()> {
    let (txoff, txsize) = commit_record(clog, id)?;
    buf.resize(txsize as usize, 0);
    read_exact_at(txlog, buf, txoff)?;
    tx.decode(buf, prev_alh)?;
    if tx.header.id != id {
        return Err(Error::CorruptedTxData(format!(
            "commit log points at tx {}, record says {}",
            id, tx.header.id
        )));
    }
    Ok(())
}

/// Streams committed transactions in id order, starting from a given id.
///
/// The reader recomputes the ALH chain as it goes, so every yielded
/// transaction carries a fully populated header. [`TxReader::read`]
/// returns `Ok(None)` once the last committed transaction has been
/// yielded; new commits arriving later make it resume.
pub struct TxReader {
    clog: Arc<dyn Appendable>,
    txlog: Arc<dyn Appendable>,
    next: u64,
    prev_alh: Digest,
    buf: Vec<u8>,
    tx: Tx,
}

impl TxReader {
    pub(crate) fn new(
        clog: Arc<dyn Appendable>,
        txlog: Arc<dyn Appendable>,
        from_id: u64,
        buf_size: usize,
        prev_alh: Digest,
    ) -> Self {
        Self {
            clog,
            txlog,
            next: from_id,
            prev_alh,
            buf: Vec::with_capacity(buf_size),
            tx: Tx::new(),
        }
    }

    /// The id the next successful [`TxReader::read`] will yield.
    pub fn next_id(&self) -> u64 {
        self.next
    }

    /// The next committed transaction, or `Ok(None)` at the end of the
    /// stream.
    pub fn read(&mut self) -> Result<Option<&Tx>> {
        if self.next > committed_count(self.clog.as_ref())? {
            return Ok(None);
        }

        read_tx_at(
            self.clog.as_ref(),
            self.txlog.as_ref(),
            self.next,
            &mut self.buf,
            &mut self.tx,
            self.prev_alh,
        )?;
        self.prev_alh = self.tx.header.alh();
        self.next += 1;
        Ok(Some(&self.tx))
    }
}
