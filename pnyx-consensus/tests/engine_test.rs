//! End-to-end cluster scenarios over the simulated lossy network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pnyx_consensus::{Engine, VetoEngine};
use pnyx_model::{Opcode, Operation, Query, Version};
use pnyx_net::Network;
use pnyx_net_sim::{Parameters, SimNetwork, UnreliableNetwork};
use pnyx_storage::{MemoryStore, Store};

struct Node {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
}

/// Build a cluster of `n` engines with quorum `w` over one simulated
/// network. `recovery_quorum` enables the recovery manager when non-zero.
async fn cluster(
    n: usize,
    w: usize,
    recovery_quorum: usize,
    latency: Option<Parameters>,
    token: &CancellationToken,
) -> Vec<Node> {
    let keyrings = common::test_keyrings(n);
    let sim = SimNetwork::new();

    let mut nodes = Vec::with_capacity(n);
    for keyring in keyrings {
        let store = Arc::new(MemoryStore::new());
        let sim_node = Arc::new(sim.node(recovery_quorum));
        let network: Arc<dyn Network> = match &latency {
            Some(params) => Arc::new(UnreliableNetwork::new(sim_node, params.clone())),
            None => sim_node,
        };

        let bbc = Arc::new(VetoEngine::new(network.clone(), keyring.clone(), n));
        let engine = Engine::new(store.clone(), network, bbc, keyring, w);
        engine.run(token.clone()).await.expect("engine starts");

        nodes.push(Node { engine, store });
    }

    nodes
}

fn concat_query(key: &str, data: &[u8], timeout: Duration) -> Query {
    let mut query = Query::new();
    query.set_timeout(timeout);
    query.operations = vec![Operation {
        key: key.into(),
        op: Opcode::Concat,
        data: data.to_vec(),
    }];
    query
}

/// Poll all stores until every node returns the same committed value for
/// `key`, or give up after `deadline`.
async fn await_value(nodes: &[Node], key: &str, expected: &[u8], deadline: Duration) {
    let poll = async {
        loop {
            let all_match = nodes.iter().all(|node| {
                matches!(node.store.get(key), Ok((value, _)) if value == expected)
            });
            if all_match {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    if tokio::time::timeout(deadline, poll).await.is_err() {
        let states: Vec<String> = nodes
            .iter()
            .map(|node| match node.store.get(key) {
                Ok((value, _)) => format!("{:?}", String::from_utf8_lossy(&value)),
                Err(_) => "<missing>".to_string(),
            })
            .collect();
        panic!("nodes did not converge on {expected:?} for {key:?}: {states:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn convergence_under_lossy_network() {
    let n = 20;
    let w = 20;
    let token = CancellationToken::new();

    let latency = Parameters {
        seed: 0,
        min_latency: Duration::from_millis(1),
        median_latency: Duration::from_millis(30),
        max_latency: Duration::from_millis(200),
    };
    let nodes = cluster(n, w, 0, Some(latency), &token).await;

    // Three concurrent conflicting writers on the same key.
    for (i, node) in nodes.iter().take(3).enumerate() {
        let query = concat_query("a", &[b'0' + i as u8], Duration::from_secs(i as u64));
        node.engine.submit(query).await.expect("submission");
    }

    // Let endorsements, expiries, checkpoints, and vetoes play out.
    tokio::time::sleep(Duration::from_secs(8)).await;
    token.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reference = nodes[0].store.get("a").ok().map(|(value, _)| value);
    for (i, node) in nodes.iter().enumerate() {
        let state = node.store.get("a").ok().map(|(value, _)| value);
        assert_eq!(state, reference, "node {i} diverged");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_then_add_commits_cluster_wide() {
    let token = CancellationToken::new();
    let nodes = cluster(4, 3, 0, None, &token).await;

    let mut set = Query::new();
    set.set_timeout(Duration::from_secs(5));
    set.operations = vec![Operation {
        key: "myVar".into(),
        op: Opcode::Set,
        data: b"42".to_vec(),
    }];
    nodes[0].engine.submit(set).await.expect("submission");
    await_value(&nodes, "myVar", b"42", Duration::from_secs(5)).await;

    let mut add = Query::new();
    add.set_timeout(Duration::from_secs(5));
    add.operations = vec![Operation {
        key: "myVar".into(),
        op: Opcode::Add,
        data: b"12".to_vec(),
    }];
    nodes[1].engine.submit(add).await.expect("submission");
    await_value(&nodes, "myVar", b"54", Duration::from_secs(5)).await;

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requirement_mismatch_suppresses_endorsement() {
    let token = CancellationToken::new();
    let nodes = cluster(3, 3, 0, None, &token).await;

    let mut query = Query::new();
    query.set_timeout(Duration::from_secs(2));
    query
        .requirements
        .insert("missing".into(), Version::of(b"something"));
    query.operations = vec![Operation {
        key: "missing".into(),
        op: Opcode::Set,
        data: b"x".to_vec(),
    }];
    nodes[0].engine.submit(query).await.expect("submission");

    tokio::time::sleep(Duration::from_secs(3)).await;
    for node in &nodes {
        assert!(
            node.store.get("missing").is_err(),
            "query with a failing requirement must never commit"
        );
    }
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn conflicting_sets_resolve_consistently() {
    let n = 4;
    let token = CancellationToken::new();
    let nodes = cluster(n, 3, 0, None, &token).await;

    let make = |data: &[u8]| {
        let mut query = Query::new();
        query.set_timeout(Duration::from_secs(2));
        query.operations = vec![Operation {
            key: "k".into(),
            op: Opcode::Set,
            data: data.to_vec(),
        }];
        query
    };

    // Two clients race identical-deadline conflicting writes.
    let (a, b) = tokio::join!(
        nodes[0].engine.submit(make(b"A")),
        nodes[1].engine.submit(make(b"B")),
    );
    a.expect("submission");
    b.expect("submission");

    tokio::time::sleep(Duration::from_secs(10)).await;
    token.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reference = nodes[0].store.get("k").ok().map(|(value, _)| value);
    if let Some(value) = &reference {
        assert!(
            value == b"A" || value == b"B",
            "committed value must be one of the candidates"
        );
    }
    for (i, node) in nodes.iter().enumerate() {
        let state = node.store.get("k").ok().map(|(value, _)| value);
        assert_eq!(state, reference, "node {i} diverged");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovery_restores_agreed_record() {
    let token = CancellationToken::new();
    let nodes = cluster(4, 3, 3, None, &token).await;

    // Three healthy peers hold the same record; the fourth lost it.
    let value = b"recovered".to_vec();
    let version = Version::of(&value);
    for node in nodes.iter().take(3) {
        node.store.set("k", &value, &version).expect("seed");
    }

    nodes[3].engine.recover("k").await;

    let poll = async {
        loop {
            if let Ok((data, v)) = nodes[3].store.get("k") {
                assert_eq!(data, value);
                assert_eq!(v, version);
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("recovery should restore the record");

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovery_fails_on_divergent_peers() {
    let token = CancellationToken::new();
    let nodes = cluster(4, 3, 3, None, &token).await;

    // Peers disagree on the record.
    for (i, node) in nodes.iter().take(3).enumerate() {
        let value = format!("divergent-{i}").into_bytes();
        node.store.set("k", &value, &Version::of(&value)).expect("seed");
    }

    nodes[3].engine.recover("k").await;
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(
        nodes[3].store.get("k").is_err(),
        "divergent peers must not populate the store"
    );
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dump_restores_engine_state() {
    let token = CancellationToken::new();
    let nodes = cluster(3, 3, 0, None, &token).await;

    let mut query = Query::new();
    query.set_timeout(Duration::from_secs(30));
    query.operations = vec![Operation {
        key: "x".into(),
        op: Opcode::Concat,
        data: b"1".to_vec(),
    }];
    nodes[0].engine.submit(query).await.expect("submission");
    await_value(&nodes, "x", b"1", Duration::from_secs(5)).await;

    let mut snapshot = Vec::new();
    nodes[0].engine.dump(&mut snapshot).expect("dump");

    let restored = cluster(1, 3, 0, None, &token).await;
    restored[0]
        .engine
        .load(snapshot.as_slice())
        .expect("load");

    let mut check = Vec::new();
    restored[0].engine.dump(&mut check).expect("re-dump");
    // Serialized form uses maps, so compare lengths rather than bytes.
    assert_eq!(snapshot.len(), check.len());

    token.cancel();
}
