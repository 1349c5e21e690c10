//! Per-round pipeline plumbing shared by the request and upload shuffles:
//! the gather stage, the hand-off point a predecessor server's
//! already-shuffled array arrives at, and the `MaxRounds`-slot cyclic
//! table that pins round `r` to slot `r mod MaxRounds`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::config::ClientId;
use crate::error::Error;

/// A payload shuffled by the request/upload pipelines: carries an `id`
/// that is meaningful only in flight between a client's submission and
/// the gather stage, cleared once the array is assembled, and a
/// byte payload that the shuffle stage authenticated-decrypts in place.
pub trait PipelineItem: Send + 'static {
    fn clear_id(&mut self);
    fn payload_mut(&mut self) -> &mut Vec<u8>;
}

impl PipelineItem for crate::wire::Request {
    fn clear_id(&mut self) {
        self.id = 0;
    }
    fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.hash
    }
}

impl PipelineItem for crate::wire::Block {
    fn clear_id(&mut self) {
        self.id = 0;
    }
    fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }
}

/// The plaintext array a round's shuffle published, keyed by round and pruned once a
/// round falls more than `MaxRounds` behind the newest publication.
pub struct PublishedTable<T> {
    entries: Mutex<HashMap<u64, Arc<Vec<T>>>>,
    ready: Notify,
    max_rounds: u64,
}

impl<T: Send + Sync + 'static> PublishedTable<T> {
    pub fn new(max_rounds: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ready: Notify::new(),
            max_rounds,
        }
    }

    pub async fn publish(&self, round: u64, items: Arc<Vec<T>>) {
        let mut entries = self.entries.lock().await;
        entries.insert(round, items);
        if round >= self.max_rounds {
            entries.remove(&(round - self.max_rounds));
        }
        drop(entries);
        self.ready.notify_waiters();
    }

    /// `GetReqHashes`/`GetUpHashes`: blocks until `round`'s plaintext array
    /// has been published.
    pub async fn get(&self, round: u64) -> Arc<Vec<T>> {
        loop {
            let notified = self.ready.notified();
            if let Some(items) = self.entries.lock().await.get(&round).cloned() {
                return items;
            }
            notified.await;
        }
    }
}

struct SlotHandle<T> {
    round: u64,
    gather_tx: mpsc::Sender<(ClientId, T)>,
    aggregate_tx: mpsc::Sender<Vec<T>>,
}

/// The receiving half of one slot's channels, owned by that slot's
/// handler loop and rotated forward one `MaxRounds` hop at a time.
pub struct SlotCursor<T> {
    pub round: u64,
    gather_rx: mpsc::Receiver<(ClientId, T)>,
    aggregate_rx: mpsc::Receiver<Vec<T>>,
}

impl<T: PipelineItem> SlotCursor<T> {
    /// Collects exactly one item per client, in client-index order, with
    /// `id` cleared on each. Only ever called by the
    /// chain head (server 0): every other server receives its array
    /// pre-aggregated from its predecessor via [`RoundTable::receive_aggregated`].
    pub async fn gather_all(&mut self, total_clients: u32) -> Vec<T> {
        let mut collected: Vec<Option<T>> = (0..total_clients).map(|_| None).collect();
        let mut remaining = collected.len();
        while remaining > 0 {
            let (client, mut item) = self
                .gather_rx
                .recv()
                .await
                .expect("gather channel dropped while its round is still live");
            item.clear_id();
            let idx = client.as_usize();
            if collected[idx].is_none() {
                remaining -= 1;
            }
            collected[idx] = Some(item);
        }
        collected
            .into_iter()
            .map(|item| item.expect("every client slot filled before gather_all returns"))
            .collect()
    }

    /// Awaits the predecessor's already-shuffled array (servers 1..N-1),
    /// or this server's own gather result handed off internally.
    pub async fn recv_aggregated(&mut self) -> Vec<T> {
        self.aggregate_rx
            .recv()
            .await
            .expect("aggregation channel dropped while its round is still live")
    }
}

/// The `MaxRounds`-slot cyclic table of gather/aggregate channels for one
/// pipeline (requests, or uploads). Round `r` always lives at slot
/// `r mod MaxRounds`; a slot's handler loop owns the matching [`SlotCursor`]
/// and calls [`RoundTable::rotate`] once it finishes round `r` to pick up
/// round `r + MaxRounds`.
pub struct RoundTable<T> {
    slots: Vec<RwLock<SlotHandle<T>>>,
    total_clients: u32,
}

impl<T: PipelineItem> RoundTable<T> {
    /// Builds the table and hands back one cursor per slot, for rounds
    /// `0..max_rounds`.
    pub fn new(max_rounds: u64, total_clients: u32) -> (Self, Vec<SlotCursor<T>>) {
        let capacity = total_clients.max(1) as usize;
        let mut slots = Vec::with_capacity(max_rounds as usize);
        let mut cursors = Vec::with_capacity(max_rounds as usize);
        for round in 0..max_rounds {
            let (gather_tx, gather_rx) = mpsc::channel(capacity);
            let (aggregate_tx, aggregate_rx) = mpsc::channel(1);
            slots.push(RwLock::new(SlotHandle {
                round,
                gather_tx,
                aggregate_tx,
            }));
            cursors.push(SlotCursor {
                round,
                gather_rx,
                aggregate_rx,
            });
        }
        (
            Self {
                slots,
                total_clients,
            },
            cursors,
        )
    }

    fn slot_index(&self, round: u64) -> usize {
        (round % self.slots.len() as u64) as usize
    }

    /// `RequestBlock2`/`UploadBlock2`: injects one client's submission into
    /// the gather stage of the round it names.
    pub async fn submit(&self, round: u64, client: ClientId, item: T) -> Result<(), Error> {
        let idx = self.slot_index(round);
        let handle = self.slots[idx].read().await;
        if handle.round != round {
            return Err(Error::ProtocolSequence(format!(
                "client submission for round {round} arrived while slot {idx} is serving round {}",
                handle.round
            )));
        }
        handle
            .gather_tx
            .send((client, item))
            .await
            .map_err(|_| Error::ProtocolSequence(format!("round {round} gather stage already closed")))
    }

    /// `ShareServer{Requests,Blocks}`: hands a predecessor's already-shuffled
    /// array straight to the aggregation stage, reusing the same shuffle
    /// step the chain head's own gather result feeds into.
    pub async fn receive_aggregated(&self, round: u64, items: Vec<T>) -> Result<(), Error> {
        let idx = self.slot_index(round);
        let handle = self.slots[idx].read().await;
        if handle.round != round {
            return Err(Error::ProtocolSequence(format!(
                "predecessor array for round {round} arrived while slot {idx} is serving round {}",
                handle.round
            )));
        }
        handle
            .aggregate_tx
            .send(items)
            .await
            .map_err(|_| Error::ProtocolSequence(format!("round {round} aggregation stage already closed")))
    }

    /// Hands the chain head's own gather result to the aggregation stage,
    /// so server 0 and servers 1..N-1 share one shuffle code path.
    pub async fn submit_local_aggregate(&self, round: u64, items: Vec<T>) {
        let idx = self.slot_index(round);
        let handle = self.slots[idx].read().await;
        debug_assert_eq!(handle.round, round);
        let _ = handle.aggregate_tx.send(items).await;
    }

    /// Rotates a slot's cursor forward by `MaxRounds`, publishing fresh
    /// channels so traffic for the new round finds a live receiver.
    pub async fn rotate(&self, mut cursor: SlotCursor<T>) -> SlotCursor<T> {
        let idx = self.slot_index(cursor.round);
        let next_round = cursor.round + self.slots.len() as u64;
        let capacity = self.total_clients.max(1) as usize;
        let (gather_tx, gather_rx) = mpsc::channel(capacity);
        let (aggregate_tx, aggregate_rx) = mpsc::channel(1);
        {
            let mut handle = self.slots[idx].write().await;
            handle.round = next_round;
            handle.gather_tx = gather_tx;
            handle.aggregate_tx = aggregate_tx;
        }
        cursor.round = next_round;
        cursor.gather_rx = gather_rx;
        cursor.aggregate_rx = aggregate_rx;
        cursor
    }

    pub fn max_rounds(&self) -> u64 {
        self.slots.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Request;

    fn req(round: u64, id: u32) -> Request {
        Request {
            hash: vec![id as u8],
            round,
            id,
        }
    }

    #[tokio::test]
    async fn gather_assembles_in_client_order_and_clears_id() {
        let (table, mut cursors) = RoundTable::<Request>::new(2, 3);
        let cursor = &mut cursors[0];

        table.submit(0, ClientId(2), req(0, 2)).await.unwrap();
        table.submit(0, ClientId(0), req(0, 0)).await.unwrap();
        table.submit(0, ClientId(1), req(0, 1)).await.unwrap();

        let items = cursor.gather_all(3).await;
        assert_eq!(items.iter().map(|r| r.hash[0]).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(items.iter().all(|r| r.id == 0));
    }

    #[tokio::test]
    async fn submit_rejects_a_stale_round() {
        let (table, _cursors) = RoundTable::<Request>::new(2, 1);
        let err = table.submit(4, ClientId(0), req(4, 0)).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolSequence(_)));
    }

    #[tokio::test]
    async fn rotate_advances_by_max_rounds_and_accepts_the_next_round() {
        let (table, mut cursors) = RoundTable::<Request>::new(2, 1);
        let cursor = cursors.remove(0);
        let cursor = table.rotate(cursor).await;
        assert_eq!(cursor.round, 2);

        table.submit(2, ClientId(0), req(2, 0)).await.unwrap();
        table
            .submit(0, ClientId(0), req(0, 0))
            .await
            .expect_err("slot 0 no longer serves round 0");
    }

    #[tokio::test]
    async fn receive_aggregated_feeds_recv_aggregated() {
        let (table, mut cursors) = RoundTable::<Request>::new(1, 2);
        let cursor = &mut cursors[0];
        table
            .receive_aggregated(0, vec![req(0, 0), req(0, 0)])
            .await
            .unwrap();
        let items = cursor.recv_aggregated().await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn published_table_unblocks_a_waiter_on_publish() {
        let table = Arc::new(PublishedTable::<Request>::new(2));
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.get(5).await })
        };
        tokio::task::yield_now().await;
        table.publish(5, Arc::new(vec![req(5, 0)])).await;
        let items = waiter.await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn published_table_prunes_rounds_older_than_max_rounds() {
        let table = PublishedTable::<Request>::new(2);
        table.publish(0, Arc::new(vec![req(0, 0)])).await;
        table.publish(2, Arc::new(vec![req(2, 0)])).await;
        assert!(table.entries.lock().await.get(&0).is_none());
    }
}
