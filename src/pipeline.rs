//! The per-round request/upload shuffle pipeline: gather,
//! permute under this server's π, authenticated-decrypt peel, then forward
//! to the next hop or broadcast at the chain's tail. Requests and uploads
//! share this exact skeleton, differing only in payload size and in what
//! happens once a round's plaintext array is published (`PipelineHooks`).
//!
//! **Onion layering.** A client's submitted payload is sealed once per hop,
//! innermost-first, via [`crate::cipher::seal_onion`]: the outermost layer is
//! under this client's hop-0 key, the innermost under its hop-`N-1` key. Each
//! hop's `shuffle_and_peel` opens exactly the one layer meant for it — at
//! every hop but the last the result is still ciphertext for the remaining
//! hops, which is what gets forwarded; the last hop's open lands on
//! plaintext. This composes correctly across any chain length because
//! `keys[position]` at hop `i` is this server's own per-client key (from its
//! key-shuffle share) indexed by the *same* permutation composition the
//! pipeline itself applies, so position `j` always names the same client's
//! data in both the key-shuffle and the request/upload pipelines.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cipher::{nonce_for_round, AuthCipher, XChaChaCipher};
use crate::config::ClientId;
use crate::error::Error;
use crate::permutation::Permutation;
use crate::round_state::{PipelineItem, RoundTable, SlotCursor};

/// Side effects triggered once a round's plaintext array is published,
/// either because this server is the chain's last hop (produced locally)
/// or because the last hop broadcast it here (`PutPlain{Requests,Blocks}`).
/// Requests just record the hash list; uploads additionally hash each
/// block and hand the array to the download engine.
#[async_trait]
pub trait PipelineHooks<T>: Send + Sync {
    async fn on_published(&self, round: u64, items: Arc<Vec<T>>);
}

pub struct ShufflePipeline<T: PipelineItem> {
    is_chain_head: bool,
    is_last_hop: bool,
    total_clients: u32,
    permutation: Arc<Permutation>,
    keys: Arc<Vec<[u8; 32]>>,
    table: RoundTable<T>,
    hooks: Arc<dyn PipelineHooks<T>>,
}

impl<T: PipelineItem> ShufflePipeline<T> {
    pub fn new(
        is_chain_head: bool,
        is_last_hop: bool,
        total_clients: u32,
        max_rounds: u64,
        permutation: Arc<Permutation>,
        keys: Arc<Vec<[u8; 32]>>,
        hooks: Arc<dyn PipelineHooks<T>>,
    ) -> (Self, Vec<SlotCursor<T>>) {
        let (table, cursors) = RoundTable::new(max_rounds, total_clients);
        (
            Self {
                is_chain_head,
                is_last_hop,
                total_clients,
                permutation,
                keys,
                table,
                hooks,
            },
            cursors,
        )
    }

    pub fn table(&self) -> &RoundTable<T> {
        &self.table
    }

    /// Permutes the gathered/received array by π, then opens each position's
    /// outermost remaining onion layer with this server's per-position key
    /// and a nonce derived from `round` — at every hop but the last this
    /// yields still-sealed bytes for the remaining hops, not plaintext. A
    /// failed open is fatal; the position index stands in for the (by now
    /// anonymized) client id in the error, since identity is no longer
    /// recoverable here.
    fn shuffle_and_peel(&self, round: u64, items: Vec<T>) -> Result<Vec<T>, Error> {
        let mut shuffled = self.permutation.permute(&items);
        let nonce = nonce_for_round(round);
        for (position, item) in shuffled.iter_mut().enumerate() {
            let key = self.keys[position];
            let opened = XChaChaCipher::open(&key, &nonce, item.payload_mut())
                .map_err(|_| Error::CryptoOpen(ClientId(position as u32)))?;
            *item.payload_mut() = opened;
        }
        Ok(shuffled)
    }

    /// Runs one round to completion and returns the cursor rotated forward
    /// to the slot's next occurrence (`round + MaxRounds`).
    ///
    /// `forward_to_next` delivers the shuffled array to this server's
    /// successor (`ShareServer{Requests,Blocks}`); called only when this
    /// server is not the chain's last hop. `broadcast_to_all` fans the
    /// final plaintext array out to every *other* server
    /// (`PutPlain{Requests,Blocks}`); called only at the last hop, after
    /// which this server's own [`PipelineHooks::on_published`] is invoked
    /// directly (there is no RPC loopback to itself).
    pub async fn run_round<FFwd, FFwdFut, FCast, FCastFut>(
        &self,
        cursor: SlotCursor<T>,
        forward_to_next: FFwd,
        broadcast_to_all: FCast,
    ) -> Result<SlotCursor<T>, Error>
    where
        FFwd: FnOnce(u64, Vec<T>) -> FFwdFut,
        FFwdFut: Future<Output = Result<(), Error>>,
        FCast: FnOnce(u64, Vec<T>) -> FCastFut,
        FCastFut: Future<Output = Result<(), Error>>,
        T: Clone,
    {
        let mut cursor = cursor;
        let round = cursor.round;

        let gathered = if self.is_chain_head {
            cursor.gather_all(self.total_clients).await
        } else {
            cursor.recv_aggregated().await
        };

        let opened = self.shuffle_and_peel(round, gathered)?;

        if self.is_last_hop {
            let published = Arc::new(opened);
            broadcast_to_all(round, (*published).clone()).await?;
            self.hooks.on_published(round, published).await;
        } else {
            forward_to_next(round, opened).await?;
        }

        Ok(self.table.rotate(cursor).await)
    }
}
