//! One server node: wires the registration coordinator, key-shuffle engine,
//! request/upload shuffle pipelines, and the PIR download engine into the
//! full client- and peer-facing RPC surface.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::cipher::symmetric_key_from_point;
use crate::config::{ClientId, ClusterConfig, ServerId};
use crate::download::DownloadEngine;
use crate::error::Error;
use crate::group::CryptoGroup;
use crate::keyshuffle::KeyShuffleEngine;
use crate::peer::{Cluster, PeerHandle};
use crate::permutation::Permutation;
use crate::pipeline::{PipelineHooks, ShufflePipeline};
use crate::prg::{Prg, Shake256Prg};
use crate::registration::RegistrationCoordinator;
use crate::round_state::PublishedTable;
use crate::wire::{AuxKeyProof, Block, ClientBlock, ClientDh, ClientMask, ClientRegistration, InternalKey, Request, UpKey};

struct RequestHooks {
    published: Arc<PublishedTable<Request>>,
}

#[async_trait]
impl PipelineHooks<Request> for RequestHooks {
    async fn on_published(&self, round: u64, items: Arc<Vec<Request>>) {
        self.published.publish(round, items).await;
    }
}

struct BlockHooks<G: CryptoGroup> {
    published: Arc<PublishedTable<Block>>,
    download: Arc<DownloadEngine>,
    cluster: Arc<Cluster<G>>,
}

#[async_trait]
impl<G: CryptoGroup> PipelineHooks<Block> for BlockHooks<G> {
    async fn on_published(&self, round: u64, items: Arc<Vec<Block>>) {
        self.published.publish(round, items).await;
        if let Err(err) = self.download.push_remote_contributions(round, &self.cluster).await {
            tracing::error!(round, %err, "failed to push PIR contributions for round");
        }
    }
}

struct Pipelines {
    requests: Arc<ShufflePipeline<Request>>,
    blocks: Arc<ShufflePipeline<Block>>,
}

/// One cluster member. Holds everything started eagerly at construction
/// (registration, key-shuffle) plus the pieces that can only be built once
/// the cluster's client roster and this server's key-shuffle share are
/// both known — the request/upload pipelines and the download engine,
/// populated by [`Server::start`].
pub struct Server<G: CryptoGroup> {
    id: ServerId,
    config: ClusterConfig,
    permutation: Arc<Permutation>,
    registration: Arc<RegistrationCoordinator>,
    keyshuffle: Arc<KeyShuffleEngine<G>>,
    published_requests: Arc<PublishedTable<Request>>,
    published_blocks: Arc<PublishedTable<Block>>,
    cluster: OnceCell<Arc<Cluster<G>>>,
    pipelines: OnceCell<Pipelines>,
    download: OnceCell<Arc<DownloadEngine>>,
}

impl<G: CryptoGroup> Server<G> {
    pub fn new(config: ClusterConfig, sk: G::Scalar, peer_pks: &[G::Point], permutation: Arc<Permutation>) -> Self {
        let registration = Arc::new(RegistrationCoordinator::new(config.my_id, config.total_clients));
        let keyshuffle = Arc::new(KeyShuffleEngine::new(
            config.my_id,
            config.total_servers,
            config.total_clients,
            sk,
            peer_pks,
            permutation.clone(),
        ));
        Self {
            id: config.my_id,
            published_requests: Arc::new(PublishedTable::new(config.params.max_rounds)),
            published_blocks: Arc::new(PublishedTable::new(config.params.max_rounds)),
            permutation,
            registration,
            keyshuffle,
            cluster: OnceCell::new(),
            pipelines: OnceCell::new(),
            download: OnceCell::new(),
            config,
        }
    }

    fn cluster(&self) -> Result<Arc<Cluster<G>>, Error> {
        self.cluster
            .get()
            .cloned()
            .ok_or_else(|| Error::ProtocolSequence("server not started".into()))
    }

    fn pipelines(&self) -> Result<&Pipelines, Error> {
        self.pipelines.get().ok_or_else(|| {
            Error::ProtocolSequence("request/upload pipelines not ready: key shuffle still running".into())
        })
    }

    fn download(&self) -> Result<Arc<DownloadEngine>, Error> {
        self.download
            .get()
            .cloned()
            .ok_or_else(|| Error::ProtocolSequence("download engine not ready: registration still open".into()))
    }

    async fn frozen_homes(&self) -> Vec<ServerId> {
        let mut homes = Vec::with_capacity(self.config.total_clients as usize);
        for i in 0..self.config.total_clients {
            let home = self
                .registration
                .home_of(ClientId(i))
                .await
                .expect("registration closed: every client has a recorded home");
            homes.push(home);
        }
        homes
    }

    /// Starts this server's background work: runs the one-shot key shuffle
    /// to completion, then builds the request/upload pipelines and the
    /// download engine and spawns each pipeline slot's round-handler loop.
    /// Must be called exactly once, after every peer's [`PeerHandle`] is
    /// reachable.
    pub async fn start(self: &Arc<Self>, cluster: Arc<Cluster<G>>) -> Result<(), Error> {
        self.cluster
            .set(cluster.clone())
            .map_err(|_| Error::ProtocolSequence("server already started".into()))?;

        let mut rng = rand_core::OsRng;
        self.keyshuffle.run(&mut rng, self.config.total_clients, &cluster).await?;
        let per_client_points = self.keyshuffle.wait_ready().await;
        let keys: Arc<Vec<[u8; 32]>> = Arc::new(
            per_client_points
                .iter()
                .map(symmetric_key_from_point::<G>)
                .collect(),
        );

        self.registration.wait_ready().await;
        let homes = self.frozen_homes().await;
        let download = Arc::new(DownloadEngine::new(
            self.id,
            self.config.total_servers,
            homes,
            self.config.params,
            self.published_blocks.clone(),
        ));
        self.download
            .set(download.clone())
            .map_err(|_| Error::ProtocolSequence("download engine already initialized".into()))?;

        let is_head = self.id.0 == 0;
        let is_last = self.config.is_last_hop(self.id);
        let max_rounds = self.config.params.max_rounds;

        let (request_pipeline, request_cursors) = ShufflePipeline::<Request>::new(
            is_head,
            is_last,
            self.config.total_clients,
            max_rounds,
            self.permutation.clone(),
            keys.clone(),
            Arc::new(RequestHooks {
                published: self.published_requests.clone(),
            }),
        );
        let (block_pipeline, block_cursors) = ShufflePipeline::<Block>::new(
            is_head,
            is_last,
            self.config.total_clients,
            max_rounds,
            self.permutation.clone(),
            keys,
            Arc::new(BlockHooks {
                published: self.published_blocks.clone(),
                download: download.clone(),
                cluster: cluster.clone(),
            }),
        );
        let request_pipeline = Arc::new(request_pipeline);
        let block_pipeline = Arc::new(block_pipeline);
        self.pipelines
            .set(Pipelines {
                requests: request_pipeline.clone(),
                blocks: block_pipeline.clone(),
            })
            .map_err(|_| Error::ProtocolSequence("pipelines already initialized".into()))?;

        let next_hop = self.config.next_hop(self.id);

        for cursor in request_cursors {
            let pipeline = request_pipeline.clone();
            let cluster = cluster.clone();
            tokio::spawn(run_request_slot(pipeline, cursor, cluster, next_hop));
        }
        for cursor in block_cursors {
            let pipeline = block_pipeline.clone();
            let cluster = cluster.clone();
            tokio::spawn(run_block_slot(pipeline, cursor, cluster, next_hop));
        }

        Ok(())
    }

    // --- client-facing surface ---

    pub async fn register(&self) -> Result<ClientId, Error> {
        self.registration.register(&*self.cluster()?).await
    }

    pub async fn upload_keys(&self, client: ClientId, key: UpKey<G>) -> Result<(), Error> {
        self.keyshuffle.submit_client_key(client, key).await
    }

    pub async fn get_request_hashes(&self, round: u64) -> Arc<Vec<Request>> {
        self.published_requests.get(round).await
    }

    pub async fn get_upload_hashes(&self, round: u64) -> Arc<Vec<Block>> {
        self.published_blocks.get(round).await
    }

    pub async fn submit_request(&self, round: u64, client: ClientId, request: Request) -> Result<(), Error> {
        self.pipelines()?.requests.table().submit(round, client, request).await
    }

    pub async fn submit_block(&self, round: u64, client: ClientId, block: Block) -> Result<(), Error> {
        self.pipelines()?.blocks.table().submit(round, client, block).await
    }

    /// `ShareMask`: completes a client's mask-chain DH handshake, seeding
    /// `Mask[r][c]` from the derived shared secret, and hands back this
    /// server's half.
    pub async fn share_mask(&self, dh: ClientDh<G>) -> Result<ClientDh<G>, Error> {
        let mask_len = self.config.params.mask_len(self.config.total_clients);
        self.share_dh_seed(dh, |shared32| Shake256Prg::derive(&shared32, mask_len), |download| download.masks())
            .await
    }

    /// `ShareSecret`: same handshake, seeding `Secret[r][c]`.
    pub async fn share_secret(&self, dh: ClientDh<G>) -> Result<ClientDh<G>, Error> {
        let secret_size = self.config.params.secret_size;
        self.share_dh_seed(
            dh,
            |shared32| Shake256Prg::derive(&shared32, secret_size),
            |download| download.secrets(),
        )
        .await
    }

    async fn share_dh_seed(
        &self,
        dh: ClientDh<G>,
        derive_seed: impl FnOnce([u8; 32]) -> Vec<u8>,
        chain: impl FnOnce(&DownloadEngine) -> &crate::mask_secret::ChainTable,
    ) -> Result<ClientDh<G>, Error> {
        let mut rng = rand_core::OsRng;
        let server_secret = G::random_scalar(&mut rng);
        let server_public = G::mul_generator(&server_secret);
        let shared = G::mul(&dh.public, &server_secret);
        let shared32 = symmetric_key_from_point::<G>(&shared);
        let seed = derive_seed(shared32);

        let download = self.download()?;
        chain(&download).seed(dh.client, seed).await;

        Ok(ClientDh {
            client: dh.client,
            public: server_public,
        })
    }

    pub async fn get_response(&self, request: ClientMask) -> Result<Vec<u8>, Error> {
        Ok(self.download()?.get_response(request).await)
    }
}

async fn run_request_slot<G: CryptoGroup>(
    pipeline: Arc<ShufflePipeline<Request>>,
    mut cursor: crate::round_state::SlotCursor<Request>,
    cluster: Arc<Cluster<G>>,
    next_hop: Option<ServerId>,
) {
    loop {
        let fwd_cluster = cluster.clone();
        let cast_cluster = cluster.clone();
        let round = cursor.round;
        let result = pipeline
            .run_round(
                cursor,
                move |round, items| {
                    let cluster = fwd_cluster;
                    async move {
                        let next = next_hop.expect("forward_to_next only called on a non-last hop");
                        cluster.get(next)?.share_server_requests(round, items).await
                    }
                },
                move |round, items| {
                    let cluster = cast_cluster;
                    async move {
                        for peer in cluster.iter() {
                            peer.put_plain_requests(round, items.clone()).await?;
                        }
                        Ok(())
                    }
                },
            )
            .await;
        match result {
            Ok(next_cursor) => cursor = next_cursor,
            Err(err) => {
                tracing::error!(round, %err, "request pipeline round failed; stopping this slot's handler");
                return;
            }
        }
    }
}

async fn run_block_slot<G: CryptoGroup>(
    pipeline: Arc<ShufflePipeline<Block>>,
    mut cursor: crate::round_state::SlotCursor<Block>,
    cluster: Arc<Cluster<G>>,
    next_hop: Option<ServerId>,
) {
    loop {
        let fwd_cluster = cluster.clone();
        let cast_cluster = cluster.clone();
        let round = cursor.round;
        let result = pipeline
            .run_round(
                cursor,
                move |round, items| {
                    let cluster = fwd_cluster;
                    async move {
                        let next = next_hop.expect("forward_to_next only called on a non-last hop");
                        cluster.get(next)?.share_server_blocks(round, items).await
                    }
                },
                move |round, items| {
                    let cluster = cast_cluster;
                    async move {
                        for peer in cluster.iter() {
                            peer.put_plain_blocks(round, items.clone()).await?;
                        }
                        Ok(())
                    }
                },
            )
            .await;
        match result {
            Ok(next_cursor) => cursor = next_cursor,
            Err(err) => {
                tracing::error!(round, %err, "upload pipeline round failed; stopping this slot's handler");
                return;
            }
        }
    }
}

#[async_trait]
impl<G: CryptoGroup> PeerHandle<G> for Server<G> {
    fn id(&self) -> ServerId {
        self.id
    }

    async fn register2(&self, registration: ClientRegistration) -> Result<(), Error> {
        self.registration.record_home(registration.client, registration.home).await
    }

    async fn register_done2(&self, _num_clients: u32) -> Result<(), Error> {
        self.registration.mark_done();
        Ok(())
    }

    async fn put_aux_proof(&self, proof: AuxKeyProof<G>) -> Result<(), Error> {
        self.keyshuffle.put_aux_proof(proof).await;
        Ok(())
    }

    async fn share_server_keys(&self, key: InternalKey<G>) -> Result<bool, Error> {
        self.keyshuffle.share_server_keys(key).await
    }

    async fn share_server_requests(&self, round: u64, requests: Vec<Request>) -> Result<(), Error> {
        self.pipelines()?.requests.table().receive_aggregated(round, requests).await
    }

    async fn put_plain_requests(&self, round: u64, requests: Vec<Request>) -> Result<(), Error> {
        self.published_requests.publish(round, Arc::new(requests)).await;
        Ok(())
    }

    async fn share_server_blocks(&self, round: u64, blocks: Vec<Block>) -> Result<(), Error> {
        self.pipelines()?.blocks.table().receive_aggregated(round, blocks).await
    }

    async fn put_plain_blocks(&self, round: u64, blocks: Vec<Block>) -> Result<(), Error> {
        let items = Arc::new(blocks);
        self.published_blocks.publish(round, items).await;
        self.download()?.push_remote_contributions(round, &self.cluster()?).await
    }

    async fn put_client_block(&self, block: ClientBlock) -> Result<(), Error> {
        self.download()?.put_client_block(block).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{nonce_for_round, AuthCipher, XChaChaCipher};
    use crate::config::ProtocolParams;
    use crate::group::Secp256k1Group as S;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn test_params() -> ProtocolParams {
        ProtocolParams {
            block_size: 8,
            secret_size: 4,
            max_rounds: 2,
            server_port: 0,
        }
    }

    /// A single-server cluster (no peers, chain head == chain tail) is the
    /// smallest configuration that exercises registration, key-shuffle,
    /// the request/upload pipelines, and the PIR download path end to end.
    #[tokio::test]
    async fn single_server_cluster_round_trips_registration_through_download() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let sk0 = S::random_scalar(&mut rng);
        let pk0 = S::mul_generator(&sk0);
        let permutation = Arc::new(Permutation::random(2, &mut rng));
        let config = ClusterConfig::new(ServerId(0), 1, 2, test_params());

        let server = Arc::new(Server::<S>::new(config, sk0, &[pk0], permutation));
        let cluster = Arc::new(Cluster::new(Vec::new()));

        // `start` runs the key shuffle to completion before returning, and
        // that shuffle blocks on every client's key upload below, so it has
        // to run in the background while the rest of this test drives the
        // client-facing calls it is waiting on.
        let start_task = tokio::spawn({
            let server = server.clone();
            async move { server.start(cluster).await }
        });
        tokio::task::yield_now().await;

        let c0 = server.register().await.unwrap();
        let c1 = server.register().await.unwrap();
        assert_eq!((c0.0, c1.0), (0, 1));

        let cumulative_pk0 = pk0;
        let k_for = |rng: &mut ChaCha20Rng| S::mul_generator(&S::random_scalar(rng));
        let key0 = k_for(&mut rng);
        let key1 = k_for(&mut rng);

        let upload = |client: ClientId, key: <S as CryptoGroup>::Point, rng: &mut ChaCha20Rng| {
            let ct = crate::group::encrypt::<S>(rng, &cumulative_pk0, &key);
            UpKey {
                client,
                c1s: vec![ct.c1],
                c2s: vec![ct.c2],
            }
        };
        server.upload_keys(c0, upload(c0, key0, &mut rng)).await.unwrap();
        server.upload_keys(c1, upload(c1, key1, &mut rng)).await.unwrap();

        // `start` only returns once the shuffle has finished and the
        // pipelines/download engine are in place, so everything below can
        // rely on them being ready.
        start_task.await.unwrap().unwrap();

        let client_dh_secret0 = S::random_scalar(&mut rng);
        let client_dh_public0 = S::mul_generator(&client_dh_secret0);
        let server_dh0 = server
            .share_mask(ClientDh {
                client: c0,
                public: client_dh_public0,
            })
            .await
            .unwrap();
        assert_eq!(server_dh0.client, c0);

        let client_secret_dh_secret0 = S::random_scalar(&mut rng);
        let client_secret_dh_public0 = S::mul_generator(&client_secret_dh_secret0);
        server
            .share_secret(ClientDh {
                client: c0,
                public: client_secret_dh_public0,
            })
            .await
            .unwrap();

        // Shuffle_and_peel authenticated-decrypts every position in place,
        // so what a client submits has to be a real ciphertext under the
        // key-shuffle-derived key for its own uploaded point — with one
        // server that point round-trips unchanged, so `key0`/`key1` double
        // as the sealing keys the clients themselves would derive.
        let plaintext_block = vec![0xABu8; 8];
        let nonce0 = nonce_for_round(0);
        let sym_key0 = symmetric_key_from_point::<S>(&key0);
        let sym_key1 = symmetric_key_from_point::<S>(&key1);
        server
            .submit_block(
                0,
                c0,
                Block {
                    payload: XChaChaCipher::seal(&sym_key0, &nonce0, &plaintext_block),
                    round: 0,
                    id: 0,
                },
            )
            .await
            .unwrap();
        server
            .submit_block(
                0,
                c1,
                Block {
                    payload: XChaChaCipher::seal(&sym_key1, &nonce0, &vec![0u8; 8]),
                    round: 0,
                    id: 0,
                },
            )
            .await
            .unwrap();

        let published = server.get_upload_hashes(0).await;
        assert_eq!(published.len(), 2);

        // client 0 requests the slot it just uploaded to (index depends on
        // the permutation, but since both masks select their own position,
        // request every position whose plaintext equals client 0's block).
        let mask: Vec<u8> = published
            .iter()
            .map(|b| if b.payload == plaintext_block { 1 } else { 0 })
            .collect();
        let response = server
            .get_response(ClientMask {
                client: c0,
                round: 0,
                mask,
            })
            .await
            .unwrap();

        // response = selected block(s) XOR Secret[0][c0]; with a single
        // server (no remote contributions to XOR in) this is exactly the
        // masked block XORed with the freshly-seeded secret at round 0.
        assert_eq!(response.len(), 8);
        assert_ne!(response, plaintext_block, "the per-round secret must mask the raw block");
    }
}
