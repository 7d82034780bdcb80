//! Proofs over the transaction log, and their verifiers.
//!
//! Verifiers are pure functions over the proof material and the two ALHs
//! the caller trusts (obtained out of band); a failed verification is a
//! `false`, never an error.

use ledgerkv_merkle::{ahtree, Digest};
use sha2::{Digest as _, Sha256};

use crate::tx::TxHeader;

/// Proof of ALH evolution between two transactions: `terms[0]` is
/// `alh(source_id)` and each following term is the inner hash of the next
/// transaction. Linear in the span, so bounded by `max_linear_proof_len`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearProof {
    pub source_id: u64,
    pub terms: Vec<Digest>,
}

impl LinearProof {
    /// Id of the last transaction the proof reaches.
    pub fn target_id(&self) -> u64 {
        self.source_id + self.terms.len() as u64 - 1
    }
}

/// Verify that folding `proof` from `source_alh` reproduces `target_alh`,
/// proving every transaction in `(source_id, target_id]` links back to
/// `source_id`.
pub fn verify_linear_proof(
    proof: &LinearProof,
    source_id: u64,
    target_id: u64,
    source_alh: &Digest,
    target_alh: &Digest,
) -> bool {
    if proof.source_id != source_id || source_id == 0 || source_id > target_id {
        return false;
    }
    if proof.terms.len() as u64 != target_id - source_id + 1 {
        return false;
    }
    if proof.terms[0] != *source_alh {
        return false;
    }

    let mut alh = proof.terms[0];
    for inner in &proof.terms[1..] {
        let mut h = Sha256::new();
        h.update(alh);
        h.update(inner);
        alh = h.finalize().into();
    }
    alh == *target_alh
}

/// Compact proof linking two arbitrary transactions through the
/// binary-linking tree.
///
/// The headers embed each transaction's view of the tree (`bl_tx_id`,
/// `bl_root`). The tree material proves that the source's ALH is covered
/// by the target's tree and that the two tree snapshots are consistent;
/// the linear tail walks the remaining transactions the target's tree does
/// not yet cover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DualProof {
    pub source: TxHeader,
    pub target: TxHeader,
    /// Inclusion of `alh(source.id)` in the tree of `target.bl_tx_id`
    /// leaves. Empty when the target tree does not cover the source.
    pub inclusion_proof: Vec<Digest>,
    /// Consistency between the source's and target's tree snapshots.
    /// Empty when the source predates the tree.
    pub consistency_proof: Vec<Digest>,
    /// `alh(target.bl_tx_id)`, the newest leaf of the target's tree.
    pub target_bl_alh: Digest,
    /// Inclusion of `target_bl_alh` as the last leaf of the target's tree.
    pub last_inclusion_proof: Vec<Digest>,
    /// From `max(source.id, target.bl_tx_id)` up to `target.id`.
    pub linear_proof: LinearProof,
}

/// Verify a [`DualProof`] against independently obtained `source_alh` and
/// `target_alh`.
pub fn verify_dual_proof(
    proof: &DualProof,
    source_id: u64,
    target_id: u64,
    source_alh: &Digest,
    target_alh: &Digest,
) -> bool {
    let source = &proof.source;
    let target = &proof.target;

    if source.id != source_id || target.id != target_id {
        return false;
    }
    if source.id == 0 || source.id > target.id {
        return false;
    }
    if *source_alh != source.alh() || *target_alh != target.alh() {
        return false;
    }

    // The source ALH is a leaf of the target's binary-linking tree,
    // provided the tree already covers it.
    if source.id <= target.bl_tx_id
        && !ahtree::verify_inclusion(
            &proof.inclusion_proof,
            source.id - 1,
            target.bl_tx_id,
            source_alh,
            &target.bl_root,
        )
    {
        return false;
    }

    // The target's tree extends the source's tree.
    if source.bl_tx_id > 0
        && !ahtree::verify_consistency(
            &proof.consistency_proof,
            source.bl_tx_id,
            target.bl_tx_id,
            &source.bl_root,
            &target.bl_root,
        )
    {
        return false;
    }

    // The claimed newest leaf really is the last leaf of the target tree.
    if target.bl_tx_id > 0
        && !ahtree::verify_inclusion(
            &proof.last_inclusion_proof,
            target.bl_tx_id - 1,
            target.bl_tx_id,
            &proof.target_bl_alh,
            &target.bl_root,
        )
    {
        return false;
    }

    // Walk the linear tail the tree does not cover.
    if source.id <= target.bl_tx_id {
        verify_linear_proof(
            &proof.linear_proof,
            target.bl_tx_id,
            target.id,
            &proof.target_bl_alh,
            target_alh,
        )
    } else {
        verify_linear_proof(&proof.linear_proof, source.id, target.id, source_alh, target_alh)
    }
}
