//! Registration coordinator: mints globally unique client ids,
//! propagates the client→home map to every server, and signals the rest of
//! this server once the cluster's full client count has registered.
//!
//! Global uniqueness of the minted id relies on every client registering
//! through the same server (consistent with the concrete scenario in the
//! source material, where all clients register against server 0); a server
//! that receives `Register` calls concurrently with a peer would mint
//! colliding ids; see `RegistrationCollision` and DESIGN.md.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};

use crate::config::{ClientId, ServerId};
use crate::error::Error;
use crate::group::CryptoGroup;
use crate::peer::Cluster;
use crate::wire::ClientRegistration;

pub struct RegistrationCoordinator {
    my_id: ServerId,
    total_clients: u32,
    next_id: Mutex<u32>,
    home_map: RwLock<Vec<Option<ServerId>>>,
    done: AtomicBool,
    ready: Notify,
}

impl RegistrationCoordinator {
    pub fn new(my_id: ServerId, total_clients: u32) -> Self {
        Self {
            my_id,
            total_clients,
            next_id: Mutex::new(0),
            home_map: RwLock::new(vec![None; total_clients as usize]),
            done: AtomicBool::new(false),
            ready: Notify::new(),
        }
    }

    /// `Register`: mints an id under the assignment lock, records the local
    /// home-map entry, and fans `Register2` (and, if this completes the
    /// cluster, `RegisterDone2`) out to every peer.
    pub async fn register<G: CryptoGroup>(&self, cluster: &Cluster<G>) -> Result<ClientId, Error> {
        let id = {
            let mut next_id = self.next_id.lock().await;
            if *next_id >= self.total_clients {
                return Err(Error::ProtocolSequence(format!(
                    "registration closed: all {} client ids already minted",
                    self.total_clients
                )));
            }
            let id = ClientId(*next_id);
            *next_id += 1;
            id
        };

        self.record_home(id, self.my_id).await?;
        for peer in cluster.iter() {
            peer.register2(ClientRegistration {
                client: id,
                home: self.my_id,
            })
            .await?;
        }

        if id.0 + 1 == self.total_clients {
            for peer in cluster.iter() {
                peer.register_done2(self.total_clients).await?;
            }
            self.mark_done();
        }

        Ok(id)
    }

    /// `Register2`: records a peer's mint in the local client→home map.
    /// Two locks (assignment, map) so a holder of the assignment lock never
    /// blocks a peer's map update.
    pub async fn record_home(&self, client: ClientId, home: ServerId) -> Result<(), Error> {
        let mut map = self.home_map.write().await;
        let slot = map
            .get_mut(client.as_usize())
            .ok_or_else(|| Error::ProtocolSequence(format!("client id {client:?} out of range")))?;
        if let Some(existing) = *slot {
            if existing != home {
                return Err(Error::RegistrationCollision(client));
            }
        }
        *slot = Some(home);
        Ok(())
    }

    /// `RegisterDone2`: marks this server ready without re-broadcasting
    /// (the originating server already fanned the signal out).
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.ready.notify_waiters();
    }

    /// `GetNumClients`: blocks until registration has closed, then returns
    /// the configured total.
    pub async fn wait_ready(&self) -> u32 {
        loop {
            let notified = self.ready.notified();
            if self.done.load(Ordering::Acquire) {
                return self.total_clients;
            }
            notified.await;
        }
    }

    pub async fn home_of(&self, client: ClientId) -> Option<ServerId> {
        self.home_map.read().await.get(client.as_usize()).copied().flatten()
    }

    pub fn is_ready(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

pub type SharedRegistration = Arc<RegistrationCoordinator>;
