//! The server-local client permutation π.
//!
//! Generated once, uniformly at random, after registration closes; reused
//! across every round on this server; never transmitted.

use rand_core::CryptoRngCore;

/// A uniformly random permutation of `0..len`, frozen after construction.
#[derive(Debug, Clone)]
pub struct Permutation {
    /// `forward[i]` is the position item `i` is moved to.
    forward: Vec<usize>,
    inverse: Vec<usize>,
}

impl Permutation {
    /// Generates a uniformly random permutation of `0..len` via a
    /// Fisher-Yates shuffle. `len == 1` yields the identity: a single
    /// registered client gets no anonymity, but the pipeline still runs.
    pub fn random(len: usize, rng: &mut impl CryptoRngCore) -> Self {
        let mut forward: Vec<usize> = (0..len).collect();
        for i in (1..len).rev() {
            let j = (rng.next_u64() as usize) % (i + 1);
            forward.swap(i, j);
        }
        let mut inverse = vec![0; len];
        for (i, &f) in forward.iter().enumerate() {
            inverse[f] = i;
        }
        Self { forward, inverse }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Position that item at `i` is moved to.
    pub fn apply(&self, i: usize) -> usize {
        self.forward[i]
    }

    /// Original index of the item now sitting at position `i`.
    pub fn invert(&self, i: usize) -> usize {
        self.inverse[i]
    }

    /// Permutes `items` so that `items[π(i)]` (output) holds the value that
    /// was at `items[i]` (input).
    pub fn permute<T: Clone>(&self, items: &[T]) -> Vec<T> {
        assert_eq!(items.len(), self.forward.len());
        let mut out = Vec::with_capacity(items.len());
        // SAFETY-free placeholder values overwritten before being read.
        out.resize_with(items.len(), || items[0].clone());
        for (i, item) in items.iter().enumerate() {
            out[self.forward[i]] = item.clone();
        }
        out
    }
}
