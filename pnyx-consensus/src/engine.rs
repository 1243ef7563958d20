//! The consensus engine: message handlers, the endorsement decision
//! policy, commit/apply, and the checkpoint machinery.
//!
//! Every incoming query is handled in its own task with its own retry
//! loop; endorsements are drained serially; each distinct checkpoint id
//! runs the binary consensus in a dedicated task. Shared mutation goes
//! through the query-store RW lock and the endorsement mutex.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest as _, Sha256};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pnyx_keyring::KeyRing;
use pnyx_model::{
    Endorsement, Message, Proof, Query, RecoveryResponse, StartCheckpoint, Version,
};
use pnyx_net::{MessageFilter, Network, NetworkError, RecoveryHandler};
use pnyx_storage::{BatchEntry, Store};

use crate::operations::{self, Value};
use crate::query_store::QueryStore;
use crate::{BbcEngine, EngineError};

/// Endorsement retry and maintenance sweep period.
const LOOP_DURATION: Duration = Duration::from_millis(100);
/// Checkpoint aggregator silence window.
const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(3);
/// Aggregator flushes early at this many distinct candidates.
const CHECKPOINT_BATCH: usize = 100;
/// At most this many uuids per StartCheckpoint.
const CHECKPOINT_SELECT: usize = 30;
/// Cooldown between checkpoint broadcasts (10 requests/sec max).
const CHECKPOINT_COOLDOWN: Duration = Duration::from_millis(100);
/// Recently processed checkpoint ids are ignored for this long.
const CHECKPOINT_DEDUP_EXPIRY: Duration = Duration::from_secs(60);
/// Upper bound on one recovery pull.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

const CACHE_CAPACITY: usize = 1024;
const CHANNEL_CAPACITY: usize = 1024;

/// Feature switches for conservative engine behaviors.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Demote long-outdated pending queries to checkpoint candidates from
    /// the maintenance sweep. Off by default.
    pub demote_outdated: bool,
}

/// The main consensus engine of one node.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) bbc: Arc<dyn BbcEngine>,
    pub(crate) keyring: Arc<KeyRing>,
    pub(crate) qs: RwLock<QueryStore>,

    /// Recently processed checkpoint ids (dedup with expiry).
    checkpoints: StdMutex<LruCache<String, Instant>>,
    /// Memoized query hashes to avoid re-hashing re-encountered queries.
    pub(crate) hashes: StdMutex<LruCache<Uuid, pnyx_model::Digest>>,

    /// Serializes the endorsement decision across competing queries.
    endorsement_mutex: Mutex<()>,

    pending_checkpoints: mpsc::Sender<Uuid>,
    checkpoints_rx: StdMutex<Option<mpsc::Receiver<Uuid>>>,
    pending_recovery: mpsc::Sender<String>,
    recovery_rx: StdMutex<Option<mpsc::Receiver<String>>>,

    /// Pulsed whenever state-changing activity occurred; an external
    /// snapshotter can await it.
    activity: Notify,

    options: EngineOptions,
}

impl Engine {
    /// Build an engine over its collaborators. `quorum` is the number of
    /// endorsements required for applicability.
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<dyn Network>,
        bbc: Arc<dyn BbcEngine>,
        keyring: Arc<KeyRing>,
        quorum: usize,
    ) -> Arc<Engine> {
        Self::with_options(store, network, bbc, keyring, quorum, EngineOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn Store>,
        network: Arc<dyn Network>,
        bbc: Arc<dyn BbcEngine>,
        keyring: Arc<KeyRing>,
        quorum: usize,
        options: EngineOptions,
    ) -> Arc<Engine> {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is non-zero");
        let (checkpoints_tx, checkpoints_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (recovery_tx, recovery_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Arc::new(Engine {
            store,
            network,
            bbc,
            keyring,
            qs: RwLock::new(QueryStore::new(quorum)),
            checkpoints: StdMutex::new(LruCache::new(capacity)),
            hashes: StdMutex::new(LruCache::new(capacity)),
            endorsement_mutex: Mutex::new(()),
            pending_checkpoints: checkpoints_tx,
            checkpoints_rx: StdMutex::new(Some(checkpoints_rx)),
            pending_recovery: recovery_tx,
            recovery_rx: StdMutex::new(Some(recovery_rx)),
            activity: Notify::new(),
            options,
        })
    }

    /// Sign and broadcast a new query, then handle it locally like any
    /// incoming one. Returns the query uuid for the submitter's receipt.
    pub async fn submit(self: &Arc<Self>, mut query: Query) -> Result<Uuid, EngineError> {
        query.emitter = self.keyring.identity().to_string();
        self.sign_query(&mut query)?;

        debug!(uuid = %query.uuid, "submit");

        let uuid = query.uuid;
        self.network.broadcast(Message::Query(query.clone())).await?;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.handle_query(query).await;
        });
        Ok(uuid)
    }

    /// Start the background routines (non-blocking): one acceptor per
    /// message type, the checkpoint aggregator, the maintenance sweep,
    /// and the recovery worker.
    pub async fn run(self: &Arc<Self>, token: CancellationToken) -> Result<(), EngineError> {
        // Query stream: one task per incoming query.
        {
            let engine = self.clone();
            let token = token.clone();
            let filter: MessageFilter = Arc::new(|m| matches!(m, Message::Query(_)));
            tokio::spawn(async move {
                let mut rx = engine.network.accept(token, filter).await;
                while let Some(message) = rx.recv().await {
                    if let Message::Query(query) = message {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            engine.handle_query(query).await;
                        });
                    }
                }
            });
        }

        // Endorsement stream: drained serially.
        {
            let engine = self.clone();
            let token = token.clone();
            let filter: MessageFilter = Arc::new(|m| matches!(m, Message::Endorsement(_)));
            tokio::spawn(async move {
                let mut rx = engine.network.accept(token, filter).await;
                while let Some(message) = rx.recv().await {
                    if let Message::Endorsement(endorsement) = message {
                        engine.handle_endorsement(endorsement).await;
                    }
                }
            });
        }

        // Checkpoint stream: one BBC task per distinct checkpoint id.
        {
            let engine = self.clone();
            let token = token.clone();
            let filter: MessageFilter = Arc::new(|m| matches!(m, Message::StartCheckpoint(_)));
            tokio::spawn(async move {
                let mut rx = engine.network.accept(token.clone(), filter).await;
                while let Some(message) = rx.recv().await {
                    if let Message::StartCheckpoint(start) = message {
                        engine.handle_checkpoint(token.clone(), start).await;
                    }
                }
            });
        }

        // Checkpoint aggregator.
        {
            let engine = self.clone();
            let token = token.clone();
            let mut rx = self
                .checkpoints_rx
                .lock()
                .expect("engine lock poisoned")
                .take()
                .ok_or(EngineError::AlreadyRunning)?;

            tokio::spawn(async move {
                let mut pending: Vec<Uuid> = Vec::new();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        candidate = rx.recv() => {
                            let Some(candidate) = candidate else { return };
                            if !pending.contains(&candidate) {
                                pending.push(candidate);
                            }
                            if pending.len() >= CHECKPOINT_BATCH {
                                engine.flush_checkpoints(&mut pending).await;
                            }
                        }
                        _ = tokio::time::sleep(CHECKPOINT_TIMEOUT) => {
                            engine.flush_checkpoints(&mut pending).await;
                        }
                    }
                }
            });
        }

        // Maintenance sweep: keeps applicability caches warm, and
        // optionally demotes long-outdated queries to checkpoints.
        {
            let engine = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut tick = 0u32;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(LOOP_DURATION) => {}
                    }

                    tick = tick.wrapping_add(1);
                    if engine.options.demote_outdated && tick % 5 == 0 {
                        let outdated = engine
                            .qs
                            .write()
                            .expect("query store lock poisoned")
                            .outdated_queries();
                        for uuid in outdated {
                            if engine.pending_checkpoints.send(uuid).await.is_err() {
                                return;
                            }
                        }
                    } else {
                        let pending = engine
                            .qs
                            .read()
                            .expect("query store lock poisoned")
                            .pending_queries();
                        for uuid in pending {
                            engine.check_state(uuid).await;
                        }
                    }
                }
            });
        }

        // Recovery: answer peers, and work the local pull queue.
        if let Some(manager) = self.network.recovery() {
            let store = self.store.clone();
            let handler: RecoveryHandler = Arc::new(move |request| {
                let (data, version) = store
                    .get(&request.key)
                    .map_err(|e| NetworkError::Recovery(e.to_string()))?;
                Ok(RecoveryResponse {
                    key: request.key.clone(),
                    version,
                    data,
                })
            });
            manager.accept_recovery(token.clone(), handler);
            info!(handler = "ready", "recovery");
        }
        {
            let engine = self.clone();
            let token = token.clone();
            let mut rx = self
                .recovery_rx
                .lock()
                .expect("engine lock poisoned")
                .take()
                .ok_or(EngineError::AlreadyRunning)?;

            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let key = tokio::select! {
                        _ = token.cancelled() => return,
                        key = rx.recv() => match key {
                            Some(key) => key,
                            None => return,
                        },
                    };
                    engine.recover_one(&key).await;
                }
            });
        }

        Ok(())
    }

    /// The storage driver this engine commits into.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Enqueue a key for asynchronous recovery from peers.
    pub async fn recover(&self, key: impl Into<String>) {
        let _ = self.pending_recovery.send(key.into()).await;
    }

    /// Wait until some state-changing activity occurs. Single-slot: at
    /// most one pulse is retained while nobody is waiting.
    pub async fn activity_probe(&self) {
        self.activity.notified().await;
    }

    pub(crate) fn mark_active(&self) {
        self.activity.notify_one();
    }

    /// Handle one incoming query: verify, index, re-evaluate, then run
    /// the endorsement decision until it settles.
    pub(crate) async fn handle_query(&self, query: Query) {
        if let Err(e) = self.verify_query(&query) {
            warn!(uuid = %query.uuid, error = %e, "invalid query");
            return;
        }

        let inserted = self
            .qs
            .write()
            .expect("query store lock poisoned")
            .add_query(query.clone());
        if !inserted {
            return;
        }

        self.check_state(query.uuid).await;
        self.endorsement_decision(&query).await;
        self.mark_active();
    }

    /// The endorsement decision policy:
    /// 1. refuse when the query expired or a requirement fails;
    /// 2. no conflict: endorse unconditionally;
    /// 3. all conflicting queries expired: endorse conditioned on them;
    /// 4. otherwise wait and retry, tying the query's fate to whichever
    ///    competitor expires first.
    async fn endorsement_decision(&self, query: &Query) {
        loop {
            {
                let _guard = self.endorsement_mutex.lock().await;

                if !self.can_endorse(query) {
                    return;
                }

                let conflicting = self
                    .qs
                    .read()
                    .expect("query store lock poisoned")
                    .get_conflicting(query);

                if conflicting.is_empty() {
                    self.endorse(query, &[]).await;
                    return;
                }

                if conflicting.iter().all(|c| c.expired()) {
                    self.endorse(query, &conflicting).await;
                    return;
                }
            }

            tokio::time::sleep(LOOP_DURATION).await;
        }
    }

    /// A query may be endorsed while not expired and with every
    /// requirement matching the store's current version.
    fn can_endorse(&self, query: &Query) -> bool {
        if query.expired() {
            return false;
        }

        let _guard = self.store.lock();
        for (key, required) in &query.requirements {
            let current = match self.store.get(key) {
                Ok((_, version)) => version,
                Err(e) if e.is_not_found() => Version::NONE,
                Err(_) => return false,
            };
            if current.matches(required).is_err() {
                return false;
            }
        }

        true
    }

    async fn endorse(&self, query: &Query, conditions: &[Query]) {
        let condition_ids: Vec<Uuid> = conditions.iter().map(|c| c.uuid).collect();
        debug!(uuid = %query.uuid, conditions = ?condition_ids, "endorsed");

        let mut endorsement = Endorsement {
            uuid: query.uuid,
            emitter: self.keyring.identity().to_string(),
            conditions: condition_ids,
            signature: Vec::new(),
        };
        if self.sign_endorsement(&mut endorsement).is_err() {
            return;
        }

        self.qs
            .write()
            .expect("query store lock poisoned")
            .endorse(query.uuid);

        if let Err(e) = self.network.broadcast(Message::Endorsement(endorsement)).await {
            warn!(uuid = %query.uuid, error = %e, "endorsement broadcast failed");
        }
    }

    pub(crate) async fn handle_endorsement(&self, endorsement: Endorsement) {
        if self.verify_endorsement(&endorsement).is_err() {
            return;
        }

        let uuid = endorsement.uuid;
        self.qs
            .write()
            .expect("query store lock poisoned")
            .add_endorsement(endorsement);
        self.check_state(uuid).await;
        self.mark_active();
    }

    /// Deduplicate a checkpoint proposal, take the local choice, and run
    /// the binary consensus in its own task.
    pub(crate) async fn handle_checkpoint(self: &Arc<Self>, token: CancellationToken, start: StartCheckpoint) {
        if start.queries.is_empty() {
            return;
        }

        let mut uuids = start.queries.clone();
        uuids.sort();
        let id = checkpoint_id(&uuids);

        {
            let mut seen = self.checkpoints.lock().expect("engine lock poisoned");
            if let Some(at) = seen.get(&id) {
                if at.elapsed() < CHECKPOINT_DEDUP_EXPIRY {
                    return;
                }
            }
            seen.put(id.clone(), Instant::now());
        }

        let (choice, proofs) = self
            .qs
            .write()
            .expect("query store lock poisoned")
            .checkpoint_choice(&uuids);

        debug!(id = %id, state = "start", choice, "checkpoint");

        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.bbc.execute(token, &id, choice, proofs).await;
            let (decision, decision_proofs) = match outcome {
                Ok(result) => result,
                Err(e) => {
                    debug!(id = %id, error = %e, "checkpoint abandoned");
                    return;
                }
            };

            debug!(id = %id, state = "end", decision, "checkpoint");

            if !decision && choice {
                // Unexpected veto: process the attached proofs.
                for proof in decision_proofs {
                    match proof {
                        Proof::Query(query) => engine.handle_query(query).await,
                        Proof::Endorsement(endorsement) => {
                            engine.handle_endorsement(endorsement).await
                        }
                    }
                }
            }

            if decision {
                engine
                    .qs
                    .write()
                    .expect("query store lock poisoned")
                    .checkpoint_drop(&uuids);
                engine.mark_active();
            }
        });
    }

    /// Re-evaluate a query; on commit, apply it and re-check every other
    /// pending query (a commit may settle their endorsement conditions).
    pub(crate) async fn check_state(&self, uuid: Uuid) {
        let mut work = vec![uuid];
        while let Some(current) = work.pop() {
            let (committed, checkpoint) = self
                .qs
                .write()
                .expect("query store lock poisoned")
                .check_state(current);

            if committed {
                self.apply(current);
                self.mark_active();
                work.extend(
                    self.qs
                        .read()
                        .expect("query store lock poisoned")
                        .pending_queries(),
                );
            }

            for candidate in checkpoint {
                if self.pending_checkpoints.send(candidate).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Execute a committed query's operations against the store under the
    /// coarse store lock. Any failure silently aborts the attempt; the
    /// transaction will be retried by a later re-evaluation or time out.
    fn apply(&self, uuid: Uuid) {
        let _guard = self.store.lock();

        let Some(query) = self
            .qs
            .read()
            .expect("query store lock poisoned")
            .get_query(uuid)
        else {
            return;
        };

        let mut values: HashMap<String, Value> = HashMap::new();
        for op in &query.operations {
            if !values.contains_key(&op.key) {
                let data = match self.store.get(&op.key) {
                    Ok((data, _)) => data,
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => {
                        warn!(uuid = %uuid, key = %op.key, error = %e, "apply aborted");
                        return;
                    }
                };
                values.insert(op.key.clone(), Value::new(data));
            }

            let value = values.get_mut(&op.key).expect("value inserted above");
            if let Err(e) = operations::execute(op, value) {
                debug!(uuid = %uuid, key = %op.key, error = %e, "operation failed");
                return;
            }
        }

        let batch: Vec<BatchEntry> = values
            .into_iter()
            .map(|(key, value)| {
                let raw = value.into_raw();
                BatchEntry {
                    key,
                    version: Version::of(&raw),
                    value: raw,
                }
            })
            .collect();

        if let Err(e) = self.store.set_batch(&batch) {
            warn!(uuid = %uuid, error = %e, "batch write failed");
        }
    }

    async fn flush_checkpoints(&self, pending: &mut Vec<Uuid>) {
        if pending.is_empty() {
            return;
        }

        pending.sort();
        let take = CHECKPOINT_SELECT.min(pending.len());
        let selected: Vec<Uuid> = pending.drain(..take).collect();

        let start = StartCheckpoint { queries: selected };
        if let Err(e) = self.network.broadcast(Message::StartCheckpoint(start)).await {
            warn!(error = %e, "checkpoint broadcast failed");
        }
        debug!(state = "pool", sent = take, remaining = pending.len(), "checkpoint");

        // Arbitrary cooldown to avoid network contention.
        tokio::time::sleep(CHECKPOINT_COOLDOWN).await;
    }

    /// One attempt at pulling a key from peers; failures re-queue the key.
    async fn recover_one(&self, key: &str) {
        let Some(manager) = self.network.recovery() else {
            warn!(unsupported = true, "recovery");
            return;
        };

        let pulled = tokio::time::timeout(RECOVERY_TIMEOUT, manager.request_recovery(key)).await;
        let response = match pulled {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "recovery retry");
                self.retry_recovery(key);
                return;
            }
            Err(_) => {
                warn!(key = %key, "recovery timed out");
                self.retry_recovery(key);
                return;
            }
        };

        let written = {
            let _guard = self.store.lock();
            self.store.set(key, &response.data, &response.version)
        };

        match written {
            Ok(()) => info!(key = %key, "recovery success"),
            Err(e) => {
                warn!(key = %key, error = %e, "recovery retry");
                self.retry_recovery(key);
            }
        }
    }

    fn retry_recovery(&self, key: &str) {
        if self.pending_recovery.try_send(key.to_string()).is_err() {
            warn!(key = %key, reason = "queue full", "recovery abort");
        }
    }
}

/// Checkpoint identifier: `"<count>-<hex sha256(concat sorted uuids)>"`.
fn checkpoint_id(sorted: &[Uuid]) -> String {
    let mut hasher = Sha256::new();
    for uuid in sorted {
        hasher.update(uuid.to_string().as_bytes());
    }
    format!("{}-{}", sorted.len(), hex::encode(hasher.finalize()))
}
