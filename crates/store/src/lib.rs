//! Core storage engine of an immutable, verifiable key-value database.
//!
//! The engine persists a totally ordered log of transactions across three
//! append-only logs (values, transaction records, commit markers), derives
//! a per-transaction Merkle root and an accumulating hash (ALH) chain over
//! them, and maintains a lazily updated secondary index supporting point
//! and historical queries against immutable snapshots.
//!
//! ```no_run
//! use ledgerkv_store::{Options, Store, KV};
//!
//! let store = Store::open("data", Options::default())?;
//! let summary = store.commit(vec![KV::new("key", "value")])?;
//!
//! let mut tx = store.new_tx();
//! store.read_tx(summary.id, &mut tx)?;
//! assert_eq!(store.read_value(&tx, b"key")?, b"value");
//! store.close()?;
//! # Ok::<(), ledgerkv_store::Error>(())
//! ```

mod error;
mod indexer;
mod options;
pub mod proofs;
mod reader;
mod store;
mod tx;

pub use error::{Error, Result};
pub use options::Options;
pub use proofs::{verify_dual_proof, verify_linear_proof, DualProof, LinearProof};
pub use reader::TxReader;
pub use store::{IndexInfo, Snapshot, Store};
pub use tx::{Tx, TxEntry, TxHeader, TxSummary, ValueRef, KV};

/// Verify a per-transaction inclusion proof against the entry digest and
/// the transaction's `eh` root.
pub use ledgerkv_merkle::htree::{verify_inclusion, InclusionProof};
