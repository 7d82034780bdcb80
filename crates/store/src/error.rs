use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no entries provided")]
    NoEntriesProvided,

    #[error("duplicated key in transaction")]
    DuplicatedKey,

    #[error("max concurrency exceeded")]
    MaxConcurrencyExceeded,

    #[error("entry count exceeds max_tx_entries")]
    MaxTxEntriesExceeded,

    #[error("key length exceeds max_key_len")]
    MaxKeyLenExceeded,

    #[error("value length exceeds max_value_len")]
    MaxValueLenExceeded,

    #[error("linear proof span exceeds max_linear_proof_len")]
    MaxLinearProofLenExceeded,

    #[error("store is already closed")]
    AlreadyClosed,

    #[error("illegal arguments: {0}")]
    IllegalArguments(&'static str),

    #[error("store is read-only")]
    ReadOnly,

    #[error("path is not a directory: {0}")]
    PathIsNotADirectory(String),

    #[error("transaction {0} not found")]
    TxNotFound(u64),

    #[error("key not found")]
    KeyNotFound,

    #[error("corrupted transaction data: {0}")]
    CorruptedTxData(String),

    #[error("corrupted value data: hash mismatch at value log {vlog_id}, offset {voff}")]
    CorruptedValueData { vlog_id: u8, voff: u64 },

    #[error("corrupted commit log: {0}")]
    CorruptedCommitLog(String),

    #[error("index error: {0}")]
    Index(ledgerkv_tbtree::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ledgerkv_tbtree::Error> for Error {
    fn from(e: ledgerkv_tbtree::Error) -> Self {
        use ledgerkv_tbtree::Error as TE;
        match e {
            TE::KeyNotFound => Error::KeyNotFound,
            TE::AlreadyClosed => Error::AlreadyClosed,
            TE::ReadOnly => Error::ReadOnly,
            other => Error::Index(other),
        }
    }
}

impl From<ledgerkv_appendable::Error> for Error {
    fn from(e: ledgerkv_appendable::Error) -> Self {
        use ledgerkv_appendable::Error as AE;
        match e {
            AE::IllegalArguments(what) => Error::IllegalArguments(what),
            AE::ReadOnly => Error::ReadOnly,
            AE::AlreadyClosed => Error::AlreadyClosed,
            AE::PathIsNotADirectory(p) => Error::PathIsNotADirectory(p.display().to_string()),
            AE::Corrupted(msg) => Error::CorruptedTxData(msg),
            AE::Io(e) => Error::Io(e),
        }
    }
}

impl From<ledgerkv_merkle::Error> for Error {
    fn from(e: ledgerkv_merkle::Error) -> Self {
        match e {
            ledgerkv_merkle::Error::IllegalArguments(what) => Error::IllegalArguments(what),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
