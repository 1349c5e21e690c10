//! The outbound side of the RPC surface: one method per call a server
//! makes to another server. The RPC transport itself is an external
//! collaborator — this trait is the contract a real
//! transport (gRPC, QUIC, …) would implement; the test suite backs it
//! with an in-process implementation instead.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServerId;
use crate::error::Error;
use crate::group::CryptoGroup;
use crate::wire::{AuxKeyProof, Block, ClientBlock, ClientRegistration, InternalKey, Request};

#[async_trait]
pub trait PeerHandle<G: CryptoGroup>: Send + Sync {
    fn id(&self) -> ServerId;

    async fn register2(&self, registration: ClientRegistration) -> Result<(), Error>;
    async fn register_done2(&self, num_clients: u32) -> Result<(), Error>;

    async fn put_aux_proof(&self, proof: AuxKeyProof<G>) -> Result<(), Error>;
    async fn share_server_keys(&self, key: InternalKey<G>) -> Result<bool, Error>;

    async fn share_server_requests(&self, round: u64, requests: Vec<Request>) -> Result<(), Error>;
    async fn put_plain_requests(&self, round: u64, requests: Vec<Request>) -> Result<(), Error>;

    async fn share_server_blocks(&self, round: u64, blocks: Vec<Block>) -> Result<(), Error>;
    async fn put_plain_blocks(&self, round: u64, blocks: Vec<Block>) -> Result<(), Error>;

    async fn put_client_block(&self, block: ClientBlock) -> Result<(), Error>;
}

/// A cluster's set of outbound peer handles, keyed by each peer's own
/// reported `id()` rather than its position in the constructor's list —
/// callers build this from whichever *other* servers they know about, not
/// necessarily a dense `0..total_servers` run.
pub struct Cluster<G: CryptoGroup> {
    peers: HashMap<ServerId, Arc<dyn PeerHandle<G>>>,
}

impl<G: CryptoGroup> Cluster<G> {
    pub fn new(peers: Vec<Arc<dyn PeerHandle<G>>>) -> Self {
        Self {
            peers: peers.into_iter().map(|p| (p.id(), p)).collect(),
        }
    }

    /// Looks up the outbound handle for `id`. A miss surfaces as
    /// [`Error::Transport`] rather than panicking: an unreachable or
    /// unconfigured peer is a recoverable condition for the caller's round,
    /// not a process-fatal bug.
    pub fn get(&self, id: ServerId) -> Result<&Arc<dyn PeerHandle<G>>, Error> {
        self.peers
            .get(&id)
            .ok_or_else(|| Error::Transport(id, "no peer handle registered for this server".into()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PeerHandle<G>>> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
