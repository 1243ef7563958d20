//! End-to-end client scenarios through the framed TCP API.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pnyx_api::{ApiClient, ApiServer, Transaction};
use pnyx_consensus::{Engine, VetoEngine};
use pnyx_keyring::{KeyRing, TrustLevel};
use pnyx_model::{Opcode, Operation, Timestamp, Version};
use pnyx_net::Network;
use pnyx_net_sim::SimNetwork;
use pnyx_storage::MemoryStore;

async fn cluster(n: usize, w: usize, token: &CancellationToken) -> Vec<Arc<Engine>> {
    let keyrings: Vec<Arc<KeyRing>> = (0..n)
        .map(|i| {
            let ring = KeyRing::new(i.to_string());
            ring.create_private(b"pw").unwrap();
            Arc::new(ring)
        })
        .collect();
    for ring in &keyrings {
        for other in &keyrings {
            if ring.identity() != other.identity() {
                let (public, _) = other.get_public(other.identity()).unwrap();
                ring.add_public(other.identity(), TrustLevel::HIGH, &public)
                    .unwrap();
            }
        }
    }

    let sim = SimNetwork::new();
    let mut engines = Vec::with_capacity(n);
    for keyring in keyrings {
        let store = Arc::new(MemoryStore::new());
        let network: Arc<dyn Network> = Arc::new(sim.node(0));
        let bbc = Arc::new(VetoEngine::new(network.clone(), keyring.clone(), n));
        let engine = Engine::new(store, network, bbc, keyring, w);
        engine.run(token.clone()).await.unwrap();
        engines.push(engine);
    }
    engines
}

fn transaction(ops: Vec<(&str, Opcode, &[u8])>) -> Transaction {
    Transaction {
        policy: "none".into(),
        deadline: Timestamp::after(Duration::from_secs(10)),
        requirements: Default::default(),
        operations: ops
            .into_iter()
            .map(|(key, op, data)| Operation {
                key: key.into(),
                op,
                data: data.to_vec(),
            })
            .collect(),
    }
}

async fn await_get(client: &mut ApiClient, key: &str, expected: &[u8]) {
    let poll = async {
        loop {
            if let Ok((_, data)) = client.get(key).await {
                if data == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .unwrap_or_else(|_| panic!("{key:?} never reached {expected:?}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_get_and_arithmetic() {
    let token = CancellationToken::new();
    let engines = cluster(4, 3, &token).await;

    let server = ApiServer::bind(
        engines[0].clone(),
        "127.0.0.1:0".parse().unwrap(),
        token.child_token(),
    )
    .await
    .unwrap();
    let mut client = ApiClient::connect(server.local_addr()).await.unwrap();

    // Unknown keys read as not-found.
    assert!(client.get("myVar").await.is_err());

    let receipt = client
        .submit(transaction(vec![("myVar", Opcode::Set, b"42")]))
        .await
        .unwrap();
    assert!(!receipt.uuid.is_nil());
    await_get(&mut client, "myVar", b"42").await;

    // Version reflects the committed bytes.
    let (version, data) = client.get("myVar").await.unwrap();
    assert_eq!(data, b"42");
    assert_eq!(version, Version::of(b"42"));

    client
        .submit(transaction(vec![("myVar", Opcode::Add, b"12")]))
        .await
        .unwrap();
    await_get(&mut client, "myVar", b"54").await;

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_membership_through_api() {
    let token = CancellationToken::new();
    let engines = cluster(3, 2, &token).await;

    let server = ApiServer::bind(
        engines[0].clone(),
        "127.0.0.1:0".parse().unwrap(),
        token.child_token(),
    )
    .await
    .unwrap();
    let mut client = ApiClient::connect(server.local_addr()).await.unwrap();

    client
        .submit(transaction(vec![
            ("team", Opcode::Sadd, b"alice"),
            ("team", Opcode::Sadd, b"bob"),
        ]))
        .await
        .unwrap();

    let poll = async {
        loop {
            if let Ok((_, elements)) = client.members("team").await {
                if elements.len() == 2 {
                    return elements;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    let elements = tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("set transaction should commit");
    assert_eq!(elements, vec![b"alice".to_vec(), b"bob".to_vec()]);

    assert!(client.contains("team", b"alice").await.unwrap());
    assert!(!client.contains("team", b"carol").await.unwrap());

    token.cancel();
}
