//! Merkle structures backing the store's cryptographic proofs.
//!
//! Two trees share the same node hashing (SHA-256 with RFC 6962 style
//! leaf/node domain separation, lone nodes promoted to the next level):
//!
//! - [`htree::HTree`]: the small per-transaction tree over entry digests,
//!   rebuilt for every commit, yielding the transaction's `eh` root and
//!   per-entry inclusion proofs.
//! - [`ahtree::AHTree`]: the accumulating binary-linking tree over the
//!   sequence of transaction ALHs, supporting inclusion and consistency
//!   proofs between any two committed tree sizes.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub mod ahtree;
pub mod htree;

pub type Digest = [u8; 32];

pub(crate) const LEAF_PREFIX: u8 = 0x00;
pub(crate) const NODE_PREFIX: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("illegal arguments: {0}")]
    IllegalArguments(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `SHA-256(0x00 ‖ data)`.
pub fn leaf_hash(data: &[u8]) -> Digest {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(data);
    h.finalize().into()
}

/// `SHA-256(0x01 ‖ left ‖ right)`.
pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_separation() {
        let d = [7u8; 32];
        assert_ne!(leaf_hash(&d), node_hash(&d, &d));
        assert_ne!(leaf_hash(b""), [0u8; 32]);
    }
}
