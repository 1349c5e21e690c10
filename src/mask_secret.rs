//! Per-client `Mask[r][c]` / `Secret[r][c]` chains.
//!
//! Both chains have the same shape: a DH-derived seed, advanced one PRG
//! step per round. Every round touches every locally-tracked client (the
//! download engine computes a contribution for each remote client, and a
//! local contribution for each homed client, every round), so the chain
//! for one client must be advanced in strict round order even though
//! distinct round slots run as concurrent tasks.
//! `SequencedChain` is a small fairness gate on top of the per-client byte
//! buffer that makes that ordering an enforced invariant rather than a
//! scheduling accident.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::config::ClientId;
use crate::prg::Prg;

struct ChainRow {
    next_round: u64,
    bytes: Vec<u8>,
}

struct SequencedChain {
    row: Mutex<ChainRow>,
    advanced: Notify,
}

impl SequencedChain {
    fn new(seed: Vec<u8>) -> Self {
        Self {
            row: Mutex::new(ChainRow {
                next_round: 0,
                bytes: seed,
            }),
            advanced: Notify::new(),
        }
    }

    /// Waits until `round` is next in line for this chain, returns the
    /// bytes for `round`, and advances the chain to `round + 1` via one
    /// PRG step before releasing the row. Never stutters and never skips
    /// a round: a caller for `round` always observes `Prg` applied exactly
    /// `round` times to the original seed.
    async fn use_and_advance<P: Prg>(&self, round: u64) -> Vec<u8> {
        loop {
            {
                let mut row = self.row.lock().await;
                if row.next_round == round {
                    let current = row.bytes.clone();
                    row.bytes = P::advance(&row.bytes);
                    row.next_round += 1;
                    drop(row);
                    self.advanced.notify_waiters();
                    return current;
                }
                assert!(
                    row.next_round < round,
                    "mask/secret chain asked to rewind: already at round {}, requested {}",
                    row.next_round,
                    round
                );
            }
            self.advanced.notified().await;
        }
    }
}

/// A table of per-client DH-seeded PRG chains, used for both `Mask[r][c]`
/// and `Secret[r][c]` (they differ only in seed width).
pub struct ChainTable {
    rows: Vec<Arc<SequencedChain>>,
}

impl ChainTable {
    /// Creates one (not-yet-seeded) row per client; `unseeded` is used
    /// until `seed` is called for that client, matching the protocol's
    /// "populated once, after the client's `ShareMask`/`ShareSecret` call"
    /// lifecycle.
    pub fn new(total_clients: u32, unseeded: Vec<u8>) -> Self {
        let rows = (0..total_clients)
            .map(|_| Arc::new(SequencedChain::new(unseeded.clone())))
            .collect();
        Self { rows }
    }

    /// Re-seeds client `c`'s chain from a freshly established DH secret.
    /// Called once, from `ShareMask`/`ShareSecret`, before any round reads
    /// the chain; safe to call again only if the caller accepts resetting
    /// the chain back to round 0.
    pub async fn seed(&self, client: ClientId, seed: Vec<u8>) {
        let mut row = self.rows[client.as_usize()].row.lock().await;
        row.next_round = 0;
        row.bytes = seed;
    }

    pub async fn use_and_advance<P: Prg>(&self, client: ClientId, round: u64) -> Vec<u8> {
        self.rows[client.as_usize()].use_and_advance::<P>(round).await
    }
}
