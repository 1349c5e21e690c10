//! Exercises a two-server cluster: registration fan-out to a peer, the key
//! shuffle's full two-hop forward/verify path, and a two-hop request round,
//! all running over real [`Server`] instances wired together through their
//! own [`PeerHandle`] implementation rather than a test double.

use std::sync::Arc;

use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

use riffle_node::cipher::{seal_onion, symmetric_key_from_point};
use riffle_node::config::{ClientId, ClusterConfig, ProtocolParams, ServerId};
use riffle_node::group::{encrypt, CryptoGroup, Secp256k1Group as S};
use riffle_node::peer::Cluster;
use riffle_node::permutation::Permutation;
use riffle_node::wire::{Request, UpKey};
use riffle_node::Server;

fn test_params() -> ProtocolParams {
    ProtocolParams {
        block_size: 8,
        secret_size: 4,
        max_rounds: 2,
        server_port: 0,
    }
}

#[tokio::test]
async fn two_server_cluster_registers_across_peers_and_completes_the_key_shuffle() {
    let mut rng = ChaCha20Rng::seed_from_u64(99);
    let sk0 = S::random_scalar(&mut rng);
    let pk0 = S::mul_generator(&sk0);
    let sk1 = S::random_scalar(&mut rng);
    let pk1 = S::mul_generator(&sk1);
    let peer_pks = [pk0, pk1];

    let perm0 = Arc::new(Permutation::random(2, &mut rng));
    let perm1 = Arc::new(Permutation::random(2, &mut rng));

    let config0 = ClusterConfig::new(ServerId(0), 2, 2, test_params());
    let config1 = ClusterConfig::new(ServerId(1), 2, 2, test_params());

    let server0 = Arc::new(Server::<S>::new(config0, sk0, &peer_pks, perm0));
    let server1 = Arc::new(Server::<S>::new(config1, sk1, &peer_pks, perm1));

    let cluster0 = Arc::new(Cluster::new(vec![server1.clone()]));
    let cluster1 = Arc::new(Cluster::new(vec![server0.clone()]));

    let start0 = tokio::spawn({
        let server0 = server0.clone();
        async move { server0.start(cluster0).await }
    });
    let start1 = tokio::spawn({
        let server1 = server1.clone();
        async move { server1.start(cluster1).await }
    });
    // Let both background `start` tasks reach their first blocking point
    // (server 0 waiting on two key uploads, server 1 waiting on server 0's
    // forwarded key-shuffle hop) before driving the client-facing calls
    // they are each waiting on.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    // Clients always register against the chain head; registration fans
    // out `Register2`/`RegisterDone2` to every other server in the cluster.
    let c0 = server0.register().await.unwrap();
    let c1 = server0.register().await.unwrap();
    assert_eq!((c0.0, c1.0), (0, 1));

    let cumulative_pk0 = pk0;
    let cumulative_pk1 = S::add(&pk0, &pk1);
    let onion = |client, rng: &mut ChaCha20Rng| {
        let k0 = S::mul_generator(&S::random_scalar(rng));
        let k1 = S::mul_generator(&S::random_scalar(rng));
        let ct0 = encrypt::<S>(rng, &cumulative_pk0, &k0);
        let ct1 = encrypt::<S>(rng, &cumulative_pk1, &k1);
        UpKey {
            client,
            c1s: vec![ct0.c1, ct1.c1],
            c2s: vec![ct0.c2, ct1.c2],
        }
    };

    server0.upload_keys(c0, onion(c0, &mut rng)).await.unwrap();
    server0.upload_keys(c1, onion(c1, &mut rng)).await.unwrap();

    // Both servers' `start` only returns once their own hop of the key
    // shuffle is done and registration has closed, proving the cross-server
    // RPCs (`Register2`, `RegisterDone2`, `PutAuxProof`, `ShareServerKeys`)
    // all landed correctly.
    start0.await.unwrap().unwrap();
    start1.await.unwrap().unwrap();
}

/// Scenario: a request round with `C=2, N=2`. Each client onion-seals its
/// hash under its own hop-0 key (this client's share at server 0) outermost
/// and its hop-1 key (this client's share at server 1) innermost; server 0
/// peels the outer layer and forwards still-sealed bytes, server 1 peels the
/// last layer and broadcasts the plaintext hashes to every other server.
#[tokio::test]
async fn two_hop_request_round_peels_one_layer_per_hop_and_broadcasts_plaintext() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let sk0 = S::random_scalar(&mut rng);
    let pk0 = S::mul_generator(&sk0);
    let sk1 = S::random_scalar(&mut rng);
    let pk1 = S::mul_generator(&sk1);
    let peer_pks = [pk0, pk1];

    let perm0 = Arc::new(Permutation::random(2, &mut rng));
    let perm1 = Arc::new(Permutation::random(2, &mut rng));

    let config0 = ClusterConfig::new(ServerId(0), 2, 2, test_params());
    let config1 = ClusterConfig::new(ServerId(1), 2, 2, test_params());

    let server0 = Arc::new(Server::<S>::new(config0, sk0, &peer_pks, perm0));
    let server1 = Arc::new(Server::<S>::new(config1, sk1, &peer_pks, perm1));

    let cluster0 = Arc::new(Cluster::new(vec![server1.clone()]));
    let cluster1 = Arc::new(Cluster::new(vec![server0.clone()]));

    let start0 = tokio::spawn({
        let server0 = server0.clone();
        async move { server0.start(cluster0).await }
    });
    let start1 = tokio::spawn({
        let server1 = server1.clone();
        async move { server1.start(cluster1).await }
    });
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let c0 = server0.register().await.unwrap();
    let c1 = server0.register().await.unwrap();

    let cumulative_pk0 = pk0;
    let cumulative_pk1 = S::add(&pk0, &pk1);

    // Each client's own per-hop secrets: picked here (not derived), exactly
    // as a real client would pick them before submitting its `UpKey`.
    let client_secret = |rng: &mut ChaCha20Rng| {
        (
            S::mul_generator(&S::random_scalar(rng)),
            S::mul_generator(&S::random_scalar(rng)),
        )
    };
    let (c0_hop0, c0_hop1) = client_secret(&mut rng);
    let (c1_hop0, c1_hop1) = client_secret(&mut rng);

    let submit_key = |client: ClientId, hop0, hop1, rng: &mut ChaCha20Rng| {
        let ct0 = encrypt::<S>(rng, &cumulative_pk0, &hop0);
        let ct1 = encrypt::<S>(rng, &cumulative_pk1, &hop1);
        UpKey {
            client,
            c1s: vec![ct0.c1, ct1.c1],
            c2s: vec![ct0.c2, ct1.c2],
        }
    };
    server0.upload_keys(c0, submit_key(c0, c0_hop0, c0_hop1, &mut rng)).await.unwrap();
    server0.upload_keys(c1, submit_key(c1, c1_hop0, c1_hop1, &mut rng)).await.unwrap();

    start0.await.unwrap().unwrap();
    start1.await.unwrap().unwrap();

    let plaintext0 = b"hash-of-client-0-request".to_vec();
    let plaintext1 = b"hash-of-client-1-request".to_vec();

    let sealed0 = seal_onion(
        &[symmetric_key_from_point::<S>(&c0_hop0), symmetric_key_from_point::<S>(&c0_hop1)],
        0,
        &plaintext0,
    );
    let sealed1 = seal_onion(
        &[symmetric_key_from_point::<S>(&c1_hop0), symmetric_key_from_point::<S>(&c1_hop1)],
        0,
        &plaintext1,
    );

    server0
        .submit_request(0, c0, Request { hash: sealed0, round: 0, id: c0.0 })
        .await
        .unwrap();
    server0
        .submit_request(0, c1, Request { hash: sealed1, round: 0, id: c1.0 })
        .await
        .unwrap();

    // Server 1 is the last hop: it peels the final layer itself.
    let published_at_last_hop = server1.get_request_hashes(0).await;
    let mut seen: Vec<Vec<u8>> = published_at_last_hop.iter().map(|r| r.hash.clone()).collect();
    seen.sort();
    let mut expected = vec![plaintext0.clone(), plaintext1.clone()];
    expected.sort();
    assert_eq!(seen, expected);

    // Server 0 only ever saw onion-sealed bytes for this round; it learns
    // the plaintext only via server 1's `PutPlainRequests` broadcast.
    let published_at_chain_head = server0.get_request_hashes(0).await;
    let mut seen_at_head: Vec<Vec<u8>> = published_at_chain_head.iter().map(|r| r.hash.clone()).collect();
    seen_at_head.sort();
    assert_eq!(seen_at_head, expected);
}
