//! Key-shuffle engine: a one-shot (not per-round) N-hop
//! verifiable shuffle that turns each client's onion-encrypted per-server
//! key submission into a private, unlinkable per-client symmetric key for
//! every server.
//!
//! **Layering model.** `UpKey` carries one ElGamal ciphertext per server,
//! indexed `0..N-1`; layer `L` is encrypted under the *prefix* cumulative
//! key `PK_L = pk_0 + pk_1 + … + pk_L`. At hop `i` (servers process in
//! chain order `0, 1, …, N-1`), the array holds the `N-i` layers `i..N-1`
//! still outstanding. Server `i` shuffles and rerandomizes every
//! outstanding layer under its own `PK_L`, then applies one partial
//! decryption (with its own secret) to each — which completes layer `i`
//! (the only one whose full chain of contributors, `0..i`, is now done)
//! and leaves layers `i+1..N-1` reduced by one contributor apiece. Layer
//! `i`'s fully-decrypted points become this server's own per-client key
//! array; the rest are forwarded to server `i+1`, now `N-(i+1)` layers
//! wide. (No ground-truth reference implementation was available for this
//! layering convention; this prefix-sum scheme is this crate's own
//! resolution, recorded in DESIGN.md, of an otherwise-ambiguous "N-i
//! layered ciphertexts" description — a shrinking array rather than a
//! fixed-width one with sentinel overwrites.)

use std::collections::HashMap;
use std::sync::Arc;

use rand_core::CryptoRngCore;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};

use crate::config::{ClientId, ServerId};
use crate::error::Error;
use crate::group::{partial_decrypt, reencrypt, Ciphertext, CryptoGroup};
use crate::peer::Cluster;
use crate::permutation::Permutation;
use crate::shuffle_proof::{ReferenceShuffleProof, ShuffleProver, ShuffleVerifier};
use crate::wire::{AuxKeyProof, InternalKey, UpKey};

struct AuxInbox<G: CryptoGroup> {
    slots: Mutex<HashMap<ServerId, AuxKeyProof<G>>>,
    arrived: Notify,
}

impl<G: CryptoGroup> AuxInbox<G> {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
        }
    }

    async fn put(&self, proof: AuxKeyProof<G>) {
        self.slots.lock().await.insert(proof.from, proof);
        self.arrived.notify_waiters();
    }

    async fn take(&self, from: ServerId) -> AuxKeyProof<G> {
        loop {
            let notified = self.arrived.notified();
            if let Some(proof) = self.slots.lock().await.remove(&from) {
                return proof;
            }
            notified.await;
        }
    }
}

pub struct KeyShuffleEngine<G: CryptoGroup> {
    my_id: ServerId,
    total_servers: u16,
    sk: G::Scalar,
    /// Prefix sums `cumulative_pks[L] = pk_0 + … + pk_L`.
    cumulative_pks: Vec<G::Point>,
    permutation: Arc<Permutation>,
    gather_tx: mpsc::Sender<(ClientId, UpKey<G>)>,
    gather_rx: Mutex<Option<mpsc::Receiver<(ClientId, UpKey<G>)>>>,
    incoming_tx: Mutex<Option<oneshot::Sender<InternalKey<G>>>>,
    incoming_rx: Mutex<Option<oneshot::Receiver<InternalKey<G>>>>,
    aux_inbox: AuxInbox<G>,
    my_keys: RwLock<Option<Arc<Vec<G::Point>>>>,
    ready: Notify,
}

impl<G: CryptoGroup> KeyShuffleEngine<G> {
    pub fn new(
        my_id: ServerId,
        total_servers: u16,
        total_clients: u32,
        sk: G::Scalar,
        peer_pks: &[G::Point],
        permutation: Arc<Permutation>,
    ) -> Self {
        assert_eq!(peer_pks.len(), total_servers as usize);
        let mut cumulative_pks = Vec::with_capacity(peer_pks.len());
        let mut running = G::identity();
        for pk in peer_pks {
            running = G::add(&running, pk);
            cumulative_pks.push(running);
        }

        let (gather_tx, gather_rx) = mpsc::channel(total_clients.max(1) as usize);
        let (incoming_tx, incoming_rx) = oneshot::channel();

        Self {
            my_id,
            total_servers,
            sk,
            cumulative_pks,
            permutation,
            gather_tx,
            gather_rx: Mutex::new(Some(gather_rx)),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            aux_inbox: AuxInbox::new(),
            my_keys: RwLock::new(None),
            ready: Notify::new(),
        }
    }

    /// `UploadKeys`: enqueues a client's onion-encrypted key bundle. Valid
    /// only on the chain head (server 0), which is the only server that
    /// gathers directly from clients.
    pub async fn submit_client_key(&self, client: ClientId, key: UpKey<G>) -> Result<(), Error> {
        if self.my_id.0 != 0 {
            return Err(Error::ProtocolSequence(
                "key upload submitted to a server that is not the key-shuffle chain head".into(),
            ));
        }
        self.gather_tx
            .send((client, key))
            .await
            .map_err(|_| Error::ProtocolSequence("key-shuffle gather stage already closed".into()))
    }

    /// `PutAuxProof`: records a peer's pre-shuffle inputs for later
    /// verification against that peer's forwarded `InternalKey`.
    pub async fn put_aux_proof(&self, proof: AuxKeyProof<G>) {
        self.aux_inbox.put(proof).await;
    }

    /// `ShareServerKeys`: verifies the predecessor's shuffle against the
    /// `AuxKeyProof` it separately broadcast, then hands the verified
    /// array off to this server's own shuffle stage.
    pub async fn share_server_keys(&self, key: InternalKey<G>) -> Result<bool, Error> {
        let aux = self.aux_inbox.take(key.from).await;
        verify_layers::<G>(&self.cumulative_pks, key.from, &aux, &key)?;

        let tx = self
            .incoming_tx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::ProtocolSequence("key-shuffle input already delivered".into()))?;
        tx.send(key)
            .map_err(|_| Error::ProtocolSequence("key-shuffle run task is not listening".into()))?;
        Ok(true)
    }

    /// Runs this server's one hop of the key shuffle: gathers or receives
    /// the input, broadcasts `AuxKeyProof`, shuffles and partially decrypts
    /// every outstanding layer, and forwards onward (or finishes, at the
    /// last hop).
    pub async fn run(
        &self,
        rng: &mut impl CryptoRngCore,
        total_clients: u32,
        cluster: &Cluster<G>,
    ) -> Result<(), Error> {
        let starting_layer = self.my_id.as_usize();

        let (xs, ys) = if self.my_id.0 == 0 {
            let upkeys = self.gather_hop0(total_clients).await;
            let mut xs = vec![Vec::with_capacity(upkeys.len()); self.total_servers as usize];
            let mut ys = vec![Vec::with_capacity(upkeys.len()); self.total_servers as usize];
            for key in &upkeys {
                for layer in 0..self.total_servers as usize {
                    xs[layer].push(key.c1s[layer]);
                    ys[layer].push(key.c2s[layer]);
                }
            }
            (xs, ys)
        } else {
            let rx = self
                .incoming_rx
                .lock()
                .await
                .take()
                .expect("KeyShuffleEngine::run called more than once");
            let key = rx
                .await
                .map_err(|_| Error::ProtocolSequence("key-shuffle predecessor never delivered its hop".into()))?;
            (key.xss, key.yss)
        };

        let aux = AuxKeyProof {
            from: self.my_id,
            xs: xs.clone(),
            ys: ys.clone(),
        };
        for peer in cluster.iter() {
            peer.put_aux_proof(aux.clone()).await?;
        }

        let n = xs.first().map_or(0, |row| row.len());
        let mut out_xs = Vec::with_capacity(xs.len());
        let mut out_ys = Vec::with_capacity(xs.len());
        let mut out_ybars = Vec::with_capacity(xs.len());
        let mut proofs = Vec::with_capacity(xs.len());
        let mut completed: Option<Vec<G::Point>> = None;

        for (row, layer_xs) in xs.iter().enumerate() {
            let absolute_layer = starting_layer + row;
            let pk_layer = self.cumulative_pks[absolute_layer];
            let layer_ys = &ys[row];

            let perm_of_output: Vec<usize> = (0..n).map(|j| self.permutation.invert(j)).collect();
            let mut blinds = Vec::with_capacity(n);
            let mut xbars = Vec::with_capacity(n);
            let mut ybars = Vec::with_capacity(n);
            for &i in &perm_of_output {
                let blind = G::random_scalar(rng);
                let ct = Ciphertext {
                    c1: layer_xs[i],
                    c2: layer_ys[i],
                };
                let reenc = reencrypt::<G>(&ct, &pk_layer, &blind);
                xbars.push(reenc.c1);
                ybars.push(reenc.c2);
                blinds.push(blind);
            }
            let proof = ReferenceShuffleProof::prove(
                rng,
                &pk_layer,
                layer_xs,
                layer_ys,
                &xbars,
                &ybars,
                &perm_of_output,
                &blinds,
            );

            let decrypted_ys: Vec<G::Point> = xbars
                .iter()
                .zip(ybars.iter())
                .map(|(x, y)| partial_decrypt::<G>(&Ciphertext { c1: *x, c2: *y }, &self.sk))
                .collect();

            if absolute_layer == starting_layer {
                completed = Some(decrypted_ys);
            } else {
                out_xs.push(xbars);
                out_ybars.push(ybars);
                out_ys.push(decrypted_ys);
                proofs.push(proof);
            }
        }

        *self.my_keys.write().await = completed.map(Arc::new);
        self.ready.notify_waiters();

        if self.my_id.0 + 1 != self.total_servers {
            let next = ServerId(self.my_id.0 + 1);
            let internal = InternalKey {
                from: self.my_id,
                xss: out_xs,
                yss: out_ys,
                ybarss: out_ybars,
                proofs,
            };
            let accepted = cluster.get(next)?.share_server_keys(internal).await?;
            if !accepted {
                return Err(Error::ShuffleProof(self.my_id));
            }
        }
        Ok(())
    }

    async fn gather_hop0(&self, total_clients: u32) -> Vec<UpKey<G>> {
        let mut rx = self
            .gather_rx
            .lock()
            .await
            .take()
            .expect("KeyShuffleEngine::run called more than once on the chain head");
        let mut collected: Vec<Option<UpKey<G>>> = (0..total_clients).map(|_| None).collect();
        let mut remaining = collected.len();
        while remaining > 0 {
            let (client, key) = rx
                .recv()
                .await
                .expect("key-shuffle gather channel dropped while still awaiting submissions");
            let idx = client.as_usize();
            if collected[idx].is_none() {
                remaining -= 1;
            }
            collected[idx] = Some(key);
        }
        collected.into_iter().map(|k| k.expect("all clients submitted")).collect()
    }

    /// `KeyReady`: blocks until this server's own shuffle hop has produced
    /// its per-client key array.
    pub async fn wait_ready(&self) -> Arc<Vec<G::Point>> {
        loop {
            let notified = self.ready.notified();
            if let Some(keys) = self.my_keys.read().await.clone() {
                return keys;
            }
            notified.await;
        }
    }
}

fn verify_layers<G: CryptoGroup>(
    cumulative_pks: &[G::Point],
    from: ServerId,
    aux: &AuxKeyProof<G>,
    key: &InternalKey<G>,
) -> Result<(), Error> {
    let starting_layer = from.as_usize();
    if aux.xs.len() != key.xss.len() || key.xss.len() != key.ybarss.len() || key.xss.len() != key.proofs.len() {
        return Err(Error::ShuffleProof(from));
    }
    for row in 0..key.xss.len() {
        let absolute_layer = starting_layer + row;
        let pk_layer = cumulative_pks[absolute_layer];
        let ok = ReferenceShuffleProof::verify(
            &pk_layer,
            &aux.xs[row],
            &aux.ys[row],
            &key.xss[row],
            &key.ybarss[row],
            &key.proofs[row],
        );
        if !ok {
            return Err(Error::ShuffleProof(from));
        }
    }
    Ok(())
}
