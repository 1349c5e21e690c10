//! Cluster configuration and protocol-wide size constants.
//!
//! Parsing a cluster address list from a file or CLI is explicitly out of
//! scope; a `ClusterConfig` is built directly from
//! already-resolved data.

use serde::{Deserialize, Serialize};

/// Index of a server within the cluster, stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u16);

impl ServerId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Index of a client within the cluster, assigned sequentially at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Fixed byte widths and pipeline depth, shared across the whole cluster.
///
/// A plain struct of sizes rather than a set of process-global constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Width in bytes of an upload/download block payload.
    pub block_size: usize,
    /// Width in bytes of a single DH-derived per-round secret.
    pub secret_size: usize,
    /// Number of rounds that may be in flight simultaneously.
    pub max_rounds: u64,
    /// TCP port servers listen on (informational; the transport is external).
    pub server_port: u16,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            block_size: 1024,
            secret_size: 32,
            max_rounds: 4,
            server_port: 8001,
        }
    }
}

impl ProtocolParams {
    /// Number of `secret_size`-wide stripes needed to cover `total_clients`
    /// blocks, i.e. the declared length of a `Mask[r][c]` byte-string.
    pub fn mask_len(&self, total_clients: u32) -> usize {
        let clients = total_clients as usize;
        let stripes = clients.div_ceil(self.secret_size);
        stripes * self.secret_size
    }
}

/// Static cluster topology known to every server after registration closes.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub my_id: ServerId,
    pub total_servers: u16,
    pub total_clients: u32,
    pub params: ProtocolParams,
}

impl ClusterConfig {
    pub fn new(my_id: ServerId, total_servers: u16, total_clients: u32, params: ProtocolParams) -> Self {
        Self {
            my_id,
            total_servers,
            total_clients,
            params,
        }
    }

    pub fn is_last_hop(&self, id: ServerId) -> bool {
        id.0 + 1 == self.total_servers
    }

    pub fn next_hop(&self, id: ServerId) -> Option<ServerId> {
        if self.is_last_hop(id) {
            None
        } else {
            Some(ServerId(id.0 + 1))
        }
    }

    pub fn all_server_ids(&self) -> impl Iterator<Item = ServerId> {
        (0..self.total_servers).map(ServerId)
    }

    pub fn peer_server_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.all_server_ids().filter(move |id| *id != self.my_id)
    }
}
