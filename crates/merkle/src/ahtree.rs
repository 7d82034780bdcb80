//! Accumulating append-only hash tree (the binary-linking tree).
//!
//! Holds one leaf per committed transaction (the transaction's ALH) and
//! answers inclusion and consistency proofs between any two historical tree
//! sizes. Only complete subtrees are materialized: `levels[l][j]` is the
//! hash over leaves `[j * 2^l, (j + 1) * 2^l)`. Roots of incomplete ranges
//! are folded on demand, which keeps appends O(1) amortized.

use crate::{leaf_hash, node_hash, Digest, Error, Result};

#[derive(Debug, Clone, Default)]
pub struct AHTree {
    levels: Vec<Vec<Digest>>,
}

impl AHTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves.
    pub fn size(&self) -> u64 {
        self.levels.first().map_or(0, |l| l.len() as u64)
    }

    /// Append a leaf, returning the new tree size.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf_hash(data));

        let mut level = 0;
        while self.levels[level].len() % 2 == 0 {
            let nodes = &self.levels[level];
            let parent = node_hash(&nodes[nodes.len() - 2], &nodes[nodes.len() - 1]);
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            self.levels[level + 1].push(parent);
            level += 1;
        }

        self.size()
    }

    /// Root over the first `n` leaves. The empty tree's root is all zeroes.
    pub fn root_at(&self, n: u64) -> Result<Digest> {
        if n > self.size() {
            return Err(Error::IllegalArguments("n"));
        }
        if n == 0 {
            return Ok([0u8; 32]);
        }
        Ok(self.range_root(0, n))
    }

    pub fn root(&self) -> Digest {
        self.root_at(self.size()).expect("size is always in range")
    }

    /// Inclusion proof for 0-based leaf `i` within the tree over the first
    /// `n` leaves. Terms are ordered bottom-up; orientation follows from
    /// the index arithmetic shared with the verifier.
    pub fn inclusion_proof(&self, i: u64, n: u64) -> Result<Vec<Digest>> {
        if n == 0 || n > self.size() || i >= n {
            return Err(Error::IllegalArguments("i"));
        }

        let mut terms = Vec::new();
        let mut idx = i;
        let mut level = 0u32;
        let mut level_width = n;
        while level_width > 1 {
            let sibling = idx ^ 1;
            if sibling < level_width {
                let span = 1u64 << level;
                let a = sibling * span;
                let b = ((sibling + 1) * span).min(n);
                terms.push(self.range_root(a, b));
            }
            idx >>= 1;
            level_width = level_width.div_ceil(2);
            level += 1;
        }
        Ok(terms)
    }

    /// Consistency proof between the trees over the first `m` and first `n`
    /// leaves, `1 <= m <= n`.
    pub fn consistency_proof(&self, m: u64, n: u64) -> Result<Vec<Digest>> {
        if m == 0 || m > n || n > self.size() {
            return Err(Error::IllegalArguments("m"));
        }
        let mut terms = Vec::new();
        self.subproof(m, 0, n, true, &mut terms);
        Ok(terms)
    }

    fn subproof(&self, m: u64, a: u64, b: u64, complete: bool, out: &mut Vec<Digest>) {
        let n = b - a;
        if m == n {
            if !complete {
                out.push(self.range_root(a, b));
            }
            return;
        }

        let k = largest_pow2_lt(n);
        if m <= k {
            self.subproof(m, a, a + k, complete, out);
            out.push(self.range_root(a + k, b));
        } else {
            self.subproof(m - k, a + k, b, false, out);
            out.push(self.range_root(a, a + k));
        }
    }

    /// Root over leaves `[a, b)`. Complete aligned subtrees are read from
    /// `levels` directly; everything else folds recursively.
    fn range_root(&self, a: u64, b: u64) -> Digest {
        let span = b - a;
        debug_assert!(span >= 1 && b <= self.size());

        if span.is_power_of_two() && a % span == 0 {
            let level = span.trailing_zeros() as usize;
            return self.levels[level][(a / span) as usize];
        }

        let k = largest_pow2_lt(span);
        node_hash(&self.range_root(a, a + k), &self.range_root(a + k, b))
    }
}

/// Largest power of two strictly below `n`. Requires `n >= 2`.
fn largest_pow2_lt(n: u64) -> u64 {
    debug_assert!(n >= 2);
    1u64 << (63 - (n - 1).leading_zeros())
}

/// Verify an inclusion proof produced by [`AHTree::inclusion_proof`] for
/// leaf content `data` at 0-based index `i` in a tree of `n` leaves.
pub fn verify_inclusion(terms: &[Digest], i: u64, n: u64, data: &[u8], root: &Digest) -> bool {
    if n == 0 || i >= n {
        return false;
    }

    let mut h = leaf_hash(data);
    let mut idx = i;
    let mut level_width = n;
    let mut iter = terms.iter();
    while level_width > 1 {
        let sibling = idx ^ 1;
        if sibling < level_width {
            let Some(term) = iter.next() else { return false };
            h = if idx & 1 == 0 {
                node_hash(&h, term)
            } else {
                node_hash(term, &h)
            };
        }
        idx >>= 1;
        level_width = level_width.div_ceil(2);
    }
    iter.next().is_none() && h == *root
}

/// Verify a consistency proof between the tree of `m` leaves with root
/// `root_m` and the tree of `n` leaves with root `root_n`.
pub fn verify_consistency(terms: &[Digest], m: u64, n: u64, root_m: &Digest, root_n: &Digest) -> bool {
    if m == 0 || m > n {
        return false;
    }
    if m == n {
        return terms.is_empty() && root_m == root_n;
    }

    // Skip the all-ones suffix of m - 1: the proven subtree is complete
    // exactly when m is a power of two, in which case root_m is implicit.
    let mut fnode = m - 1;
    let mut snode = n - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut iter = terms.iter();
    let first = if fnode == 0 {
        *root_m
    } else {
        match iter.next() {
            Some(h) => *h,
            None => return false,
        }
    };

    let mut fr = first;
    let mut sr = first;
    for c in iter {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);
            while fnode != 0 && fnode & 1 == 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            sr = node_hash(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    fr == *root_m && sr == *root_n && snode == 0
}
