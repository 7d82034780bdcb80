//! Per-transaction Merkle tree.
//!
//! Built once per commit from the (sorted-by-key) entry digests. Leaves are
//! hashed with the leaf prefix, pairs with the node prefix; a lone node at
//! the end of a level is promoted unchanged, which makes the tree identical
//! to the RFC 6962 Merkle tree over the same leaves.

use crate::{leaf_hash, node_hash, Digest, Error, Result};

/// Maximum number of leaves. Entry counts are u32 on disk.
pub const MAX_WIDTH: usize = u32::MAX as usize;

#[derive(Debug, Clone)]
pub struct HTree {
    /// `levels[0]` is the hashed leaf level; the last level holds the root.
    levels: Vec<Vec<Digest>>,
}

/// Proof that a leaf participates in a tree with a given root.
///
/// `terms` holds the sibling digests bottom-up; levels where the proven
/// node is promoted contribute no term. Orientation follows from `leaf`
/// and `width`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub leaf: u32,
    pub width: u32,
    pub terms: Vec<Digest>,
}

impl HTree {
    /// Build the tree over `leaves` (raw entry digests, not yet
    /// leaf-prefixed). At least one leaf is required.
    pub fn new(leaves: &[Digest]) -> Result<Self> {
        if leaves.is_empty() || leaves.len() > MAX_WIDTH {
            return Err(Error::IllegalArguments("leaves"));
        }

        let mut levels = vec![leaves.iter().map(|l| leaf_hash(l)).collect::<Vec<_>>()];
        while levels.last().unwrap().len() > 1 {
            let prev = levels.last().unwrap();
            let mut next = Vec::with_capacity(prev.len().div_ceil(2));
            for pair in prev.chunks(2) {
                match pair {
                    [left, right] => next.push(node_hash(left, right)),
                    [lone] => next.push(*lone),
                    _ => unreachable!(),
                }
            }
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn width(&self) -> u32 {
        self.levels[0].len() as u32
    }

    pub fn root(&self) -> Digest {
        *self.levels.last().unwrap().last().unwrap()
    }

    /// Inclusion proof for leaf index `leaf`.
    pub fn inclusion_proof(&self, leaf: u32) -> Result<InclusionProof> {
        let width = self.width();
        if leaf >= width {
            return Err(Error::IllegalArguments("leaf"));
        }

        let mut terms = Vec::new();
        let mut i = leaf as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = i ^ 1;
            if sibling < level.len() {
                terms.push(level[sibling]);
            }
            i >>= 1;
        }

        Ok(InclusionProof { leaf, width, terms })
    }
}

/// Verify `proof` against the raw `leaf_digest` and the tree `root`.
pub fn verify_inclusion(proof: &InclusionProof, leaf_digest: &Digest, root: &Digest) -> bool {
    if proof.leaf >= proof.width {
        return false;
    }

    let mut h = leaf_hash(leaf_digest);
    let mut i = proof.leaf as usize;
    let mut level_len = proof.width as usize;
    let mut terms = proof.terms.iter();

    while level_len > 1 {
        let sibling = i ^ 1;
        if sibling < level_len {
            let Some(term) = terms.next() else { return false };
            h = if i & 1 == 0 {
                node_hash(&h, term)
            } else {
                node_hash(term, &h)
            };
        }
        i >>= 1;
        level_len = level_len.div_ceil(2);
    }

    terms.next().is_none() && h == *root
}
