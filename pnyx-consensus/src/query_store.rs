//! The query store: memory-resident dependency graph of pending queries,
//! their endorsements, and the cached applicability predicate.
//!
//! Edges between queries are stored as uuid lists, never direct handles;
//! all records live in one arena map keyed by uuid. Applicability results
//! are cached per query and per endorsement, and invalidated by a
//! cascading mark that follows the dependents index and stops at nodes
//! that are already stale.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use pnyx_model::{Endorsement, Proof, Query};

/// Grace period before a non-applicable condition becomes a checkpoint
/// candidate.
const DELTA_OLD: Duration = Duration::from_secs(1);

/// Age past the deadline after which a pending query counts as outdated.
const OUTDATED_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueryState {
    Pending,
    Committed,
    Dropped,
}

/// Cached boolean with a freshness flag.
#[derive(Debug, Clone, Copy, Default)]
struct CachedFlag {
    fresh: bool,
    result: bool,
}

impl CachedFlag {
    fn fresh(&self) -> bool {
        self.fresh
    }

    fn get(&self) -> bool {
        self.result
    }

    fn set(&mut self, result: bool) {
        self.result = result;
        self.fresh = true;
    }

    fn mark(&mut self) {
        self.fresh = false;
    }
}

/// Store record of one endorsement, with its validity cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndorsementInfo {
    pub endorsement: Endorsement,
    #[serde(skip)]
    cache: CachedFlag,
}

impl EndorsementInfo {
    fn new(endorsement: Endorsement) -> Self {
        EndorsementInfo {
            endorsement,
            cache: CachedFlag::default(),
        }
    }
}

/// Store record of one query: its endorsements, reverse dependency edges,
/// lifecycle state, and applicability cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueryInfo {
    pub query: Query,
    pub endorsements: Vec<EndorsementInfo>,
    /// Queries carrying an endorsement conditioned on this one.
    pub dependents: Vec<Uuid>,
    pub state: QueryState,
    /// Locally endorsed.
    pub endorsed: bool,
    /// Speculatively applied (informational).
    pub applied: bool,
    #[serde(skip)]
    cache: CachedFlag,
}

impl QueryInfo {
    fn new(query: Query) -> Self {
        QueryInfo {
            query,
            endorsements: Vec::new(),
            dependents: Vec::new(),
            state: QueryState::Pending,
            endorsed: false,
            applied: false,
            cache: CachedFlag::default(),
        }
    }
}

/// In-memory index of queries, endorsements, and parked arrivals.
pub struct QueryStore {
    pub(crate) queries: HashMap<Uuid, QueryInfo>,
    /// Dependency edges whose target query has not arrived yet,
    /// keyed by the missing condition uuid.
    pub(crate) pending_dependencies: HashMap<Uuid, Vec<Uuid>>,
    /// Endorsements whose query has not arrived yet.
    pub(crate) pending_endorsements: Vec<Endorsement>,
    pub(crate) threshold: usize,
}

impl QueryStore {
    pub fn new(threshold: usize) -> Self {
        QueryStore {
            queries: HashMap::new(),
            pending_dependencies: HashMap::new(),
            pending_endorsements: Vec::new(),
            threshold,
        }
    }

    /// Insert a query if its uuid is new, hydrating any parked
    /// endorsements and dependency edges. Returns whether it was inserted.
    pub fn add_query(&mut self, query: Query) -> bool {
        let uuid = query.uuid;
        if self.queries.contains_key(&uuid) {
            return false;
        }

        let mut info = QueryInfo::new(query);

        let parked: Vec<Endorsement> = {
            let mut kept = Vec::with_capacity(self.pending_endorsements.len());
            let mut matching = Vec::new();
            for e in self.pending_endorsements.drain(..) {
                if e.uuid == uuid {
                    matching.push(e);
                } else {
                    kept.push(e);
                }
            }
            self.pending_endorsements = kept;
            matching
        };
        for endorsement in parked {
            self.add_endorsement_to(&mut info, endorsement);
        }

        info.dependents = self.pending_dependencies.remove(&uuid).unwrap_or_default();

        // Force the marking cascade through a default cache value.
        info.cache.set(false);
        self.queries.insert(uuid, info);
        self.cascade_mark(uuid);
        true
    }

    pub fn get_query(&self, uuid: Uuid) -> Option<Query> {
        self.queries.get(&uuid).map(|info| info.query.clone())
    }

    /// Register an endorsement. When the endorsed query is unknown the
    /// endorsement is parked. Returns (parked, inserted).
    pub fn add_endorsement(&mut self, endorsement: Endorsement) -> (bool, bool) {
        let uuid = endorsement.uuid;
        let Some(mut info) = self.queries.remove(&uuid) else {
            self.pending_endorsements.push(endorsement);
            return (true, false);
        };

        let inserted = self.add_endorsement_to(&mut info, endorsement);
        self.queries.insert(uuid, info);
        self.cascade_mark(uuid);
        (false, inserted)
    }

    /// Shared insertion path for live and hydrated endorsements. The query
    /// record is detached from the arena while edges are registered.
    fn add_endorsement_to(&mut self, info: &mut QueryInfo, endorsement: Endorsement) -> bool {
        // A second endorsement from the same emitter is discarded.
        if info
            .endorsements
            .iter()
            .any(|existing| existing.endorsement.emitter == endorsement.emitter)
        {
            return false;
        }

        for condition in &endorsement.conditions {
            if let Some(target) = self.queries.get_mut(condition) {
                add_to_set(&mut target.dependents, info.query.uuid);
            } else {
                add_to_set(
                    self.pending_dependencies.entry(*condition).or_default(),
                    info.query.uuid,
                );
            }
        }

        info.endorsements.push(EndorsementInfo::new(endorsement));
        true
    }

    /// Mark a node's cache stale and cascade through its dependents.
    ///
    /// When a node transitions from fresh to stale, every endorsement on a
    /// dependent that lists it among its conditions is marked too, and the
    /// dependent is visited in turn. Nodes that were already stale stop
    /// the cascade (idempotence).
    fn cascade_mark(&mut self, start: Uuid) {
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            let Some(info) = self.queries.get_mut(&current) else {
                continue;
            };

            let already_marked = !info.cache.fresh();
            info.cache.mark();
            if already_marked {
                continue;
            }

            let dependents = info.dependents.clone();
            for dependent in dependents {
                let Some(dep_info) = self.queries.get_mut(&dependent) else {
                    continue;
                };
                for endorsement in dep_info.endorsements.iter_mut() {
                    if endorsement.endorsement.conditions.contains(&current) {
                        endorsement.cache.mark();
                    }
                }
                stack.push(dependent);
            }
        }
    }

    /// The applicability predicate.
    ///
    /// A pending query is applicable when at least `threshold` of its
    /// endorsements are valid, an endorsement being valid when none of its
    /// conditions is applicable. Committed queries are always applicable,
    /// dropped or unknown ones never.
    pub(crate) fn is_applicable(&mut self, uuid: Uuid) -> bool {
        let mut visiting = Vec::new();
        self.is_applicable_guarded(uuid, &mut visiting)
    }

    fn is_applicable_guarded(&mut self, uuid: Uuid, visiting: &mut Vec<Uuid>) -> bool {
        match self.queries.get(&uuid) {
            None => return false,
            Some(info) => match info.state {
                QueryState::Dropped => return false,
                QueryState::Committed => return true,
                QueryState::Pending => {
                    if info.cache.fresh() {
                        return info.cache.get();
                    }
                }
            },
        }

        // A condition cycle, which only Byzantine endorsers can produce,
        // evaluates as non-applicable instead of recursing forever.
        if visiting.contains(&uuid) {
            return false;
        }
        visiting.push(uuid);
        let result = self.compute_applicable(uuid, visiting);
        visiting.pop();

        if let Some(info) = self.queries.get_mut(&uuid) {
            info.cache.set(result);
        }
        result
    }

    fn compute_applicable(&mut self, uuid: Uuid, visiting: &mut Vec<Uuid>) -> bool {
        let count = self.queries[&uuid].endorsements.len();

        // Short-circuit: not enough endorsements received at all.
        if count < self.threshold {
            return false;
        }

        let mut valid = 0;
        for index in 0..count {
            let (fresh, cached, conditions) = {
                let endorsement = &self.queries[&uuid].endorsements[index];
                (
                    endorsement.cache.fresh(),
                    endorsement.cache.get(),
                    endorsement.endorsement.conditions.clone(),
                )
            };

            let endorsement_valid = if fresh {
                cached
            } else {
                let ok = conditions
                    .iter()
                    .all(|condition| !self.is_applicable_guarded(*condition, visiting));
                if let Some(info) = self.queries.get_mut(&uuid) {
                    info.endorsements[index].cache.set(ok);
                }
                ok
            };

            if endorsement_valid {
                valid += 1;
            }
        }

        valid >= self.threshold
    }

    /// Pending queries conflicting with `query`: same policy, locally
    /// endorsed, and a non-parallelizable operation pair on a shared key.
    pub fn get_conflicting(&self, query: &Query) -> Vec<Query> {
        let mut conflicting = Vec::new();
        for (uuid, info) in &self.queries {
            if *uuid == query.uuid {
                continue; // same query
            }
            if info.state != QueryState::Pending {
                continue; // already processed
            }
            if !info.endorsed {
                continue; // not endorsed locally
            }
            if query.check_conflict(&info.query).is_err() {
                conflicting.push(info.query.clone());
            }
        }
        conflicting
    }

    /// Re-evaluate one query. Commits it when enough endorsements are
    /// definitely valid (all their conditions dropped); otherwise returns
    /// the conditions that are candidates for checkpointing.
    pub fn check_state(&mut self, uuid: Uuid) -> (bool, Vec<Uuid>) {
        let applicable = self.is_applicable(uuid);
        self.check_speculative_state(uuid, applicable);
        if !applicable {
            return (false, Vec::new());
        }

        if matches!(
            self.queries.get(&uuid).map(|info| info.state),
            Some(QueryState::Committed)
        ) {
            return (false, Vec::new());
        }

        let per_endorsement: Vec<Vec<Uuid>> = self.queries[&uuid]
            .endorsements
            .iter()
            .map(|e| e.endorsement.conditions.clone())
            .collect();

        let mut checkpoint = Vec::new();
        let mut definitely_valid = 0;
        for conditions in per_endorsement {
            let mut all_dropped = true;
            for condition in conditions {
                let state = self.queries.get(&condition).map(|info| info.state);
                if state == Some(QueryState::Dropped) {
                    continue;
                }
                all_dropped = false;

                // Unknown conditions, and conditions that are both
                // non-applicable and expired past the grace delta, go to
                // checkpointing.
                let old = match state {
                    None => true,
                    Some(_) => {
                        !self.is_applicable(condition)
                            && self.queries[&condition].query.expired_since(DELTA_OLD)
                    }
                };
                if old {
                    add_to_set(&mut checkpoint, condition);
                }
                break;
            }

            if all_dropped {
                definitely_valid += 1;
            }
        }

        if definitely_valid >= self.threshold {
            self.commit(uuid);
            return (true, checkpoint);
        }

        (false, checkpoint)
    }

    /// Uuids of every pending query.
    pub fn pending_queries(&self) -> Vec<Uuid> {
        self.queries
            .iter()
            .filter(|(_, info)| info.state == QueryState::Pending)
            .map(|(uuid, _)| *uuid)
            .collect()
    }

    /// Pending, non-applicable queries expired for longer than the
    /// demotion window.
    pub fn outdated_queries(&mut self) -> Vec<Uuid> {
        let candidates = self.pending_queries();
        candidates
            .into_iter()
            .filter(|uuid| {
                !self.is_applicable(*uuid)
                    && self.queries[uuid].query.expired_since(OUTDATED_AFTER)
            })
            .collect()
    }

    /// Decide a checkpoint proposal: veto (false) with proofs when any
    /// listed query is currently applicable, agree (true) otherwise.
    pub fn checkpoint_choice(&mut self, uuids: &[Uuid]) -> (bool, Vec<Proof>) {
        for uuid in uuids {
            if self.is_applicable(*uuid) {
                debug!(uuid = %uuid, reason = "applicable", "veto");

                let info = &self.queries[uuid];
                let mut proofs = vec![Proof::Query(info.query.clone())];
                proofs.extend(
                    info.endorsements
                        .iter()
                        .map(|e| Proof::Endorsement(e.endorsement.clone())),
                );
                return (false, proofs);
            }
        }

        (true, Vec::new())
    }

    /// Drop every listed query after a positive checkpoint decision.
    pub fn checkpoint_drop(&mut self, uuids: &[Uuid]) {
        for uuid in uuids {
            self.drop_query(*uuid);
        }
    }

    /// Flag a query as locally endorsed.
    pub fn endorse(&mut self, uuid: Uuid) {
        if let Some(info) = self.queries.get_mut(&uuid) {
            info.endorsed = true;
        }
    }

    pub(crate) fn drop_query(&mut self, uuid: Uuid) {
        let Some(info) = self.queries.get_mut(&uuid) else {
            return;
        };

        info.state = QueryState::Dropped;
        info.cache.set(false);
        self.cascade_mark(uuid);

        debug!(uuid = %uuid, "dropped");
    }

    fn commit(&mut self, uuid: Uuid) {
        let dependents = {
            let Some(info) = self.queries.get_mut(&uuid) else {
                return;
            };
            info.state = QueryState::Committed;
            info.dependents.clone()
        };

        // Drop dependents synchronously, before the commit returns.
        for dependent in dependents {
            self.drop_query(dependent);
        }

        debug!(uuid = %uuid, "committed");
    }

    // TODO hook real speculative execution behind the applied flag
    fn check_speculative_state(&mut self, uuid: Uuid, applicable: bool) {
        let Some(info) = self.queries.get_mut(&uuid) else {
            return;
        };

        if !applicable && info.applied {
            debug!(uuid = %uuid, "rolled back");
            info.applied = false;
        }

        if applicable && !info.applied {
            debug!(uuid = %uuid, "applied");
            info.applied = true;
        }
    }
}

fn add_to_set(set: &mut Vec<Uuid>, value: Uuid) {
    if !set.contains(&value) {
        set.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    fn endorsement(emitter: &str, uuid: Uuid, conditions: Vec<Uuid>) -> Endorsement {
        Endorsement {
            uuid,
            emitter: emitter.into(),
            conditions,
            signature: Vec::new(),
        }
    }

    #[test]
    fn add_endorsement_cases() {
        let mut qs = QueryStore::new(1);
        let q = Query::new();
        let unknown = Uuid::new_v4();
        assert!(qs.add_query(q.clone()));

        let cases = [
            ("a", q.uuid, false, true),
            ("b", q.uuid, false, true),
            ("a", q.uuid, false, false), // duplicate emitter
            ("a", unknown, true, false), // unknown query parks
        ];

        for (emitter, uuid, want_pending, want_inserted) in cases {
            let (pending, inserted) = qs.add_endorsement(endorsement(emitter, uuid, vec![]));
            assert_eq!(pending, want_pending, "{emitter}/{uuid}");
            assert_eq!(inserted, want_inserted, "{emitter}/{uuid}");
        }
    }

    #[test]
    fn applicability_figure_one() {
        // Two conflicting queries q and r: three unconditioned
        // endorsements for q; for r, two endorsements conditioned on q
        // plus one unconditioned.
        let q = Query::new();
        let r = Query::new();

        let eq1 = endorsement("1", q.uuid, vec![]);
        let eq2 = endorsement("2", q.uuid, vec![]);
        let eq3 = endorsement("3", q.uuid, vec![]);
        let er1 = endorsement("1", r.uuid, vec![q.uuid]);
        let er2 = endorsement("2", r.uuid, vec![q.uuid]);
        let er4 = endorsement("4", r.uuid, vec![]);

        // Simple order: queries first.
        let mut qs = QueryStore::new(3);
        qs.add_query(q.clone());
        qs.add_query(r.clone());
        qs.add_endorsement(eq1.clone());
        qs.add_endorsement(eq2.clone());
        qs.add_endorsement(er1.clone());
        qs.add_endorsement(er2.clone());
        qs.add_endorsement(er4.clone());

        assert!(qs.is_applicable(r.uuid), "r has 3 valid endorsements");
        assert!(!qs.is_applicable(q.uuid), "q has only 2 endorsements");

        qs.add_endorsement(eq3.clone());
        assert!(!qs.is_applicable(r.uuid), "r is down to 1 valid endorsement");
        assert!(qs.is_applicable(q.uuid), "q reached 3 valid endorsements");

        // Out-of-order arrival produces the same final result.
        let mut qs = QueryStore::new(3);
        qs.add_endorsement(eq1);
        qs.add_endorsement(er1);
        qs.add_query(r.clone());
        qs.add_endorsement(er2);
        qs.add_endorsement(er4);
        qs.add_endorsement(eq2);

        assert!(qs.is_applicable(r.uuid), "r has 3 valid endorsements");

        qs.add_endorsement(eq3);
        qs.add_query(q.clone());
        assert!(!qs.is_applicable(r.uuid), "r is down to 1 valid endorsement");
        assert!(qs.is_applicable(q.uuid), "q reached 3 valid endorsements");
    }

    #[test]
    fn commit_drops_dependents_atomically() {
        let q = Query::new();
        let mut r = Query::new();
        r.set_timeout(Duration::from_secs(60));

        let mut qs = QueryStore::new(1);
        qs.add_query(q.clone());
        qs.add_query(r.clone());
        qs.add_endorsement(endorsement("1", r.uuid, vec![q.uuid]));
        qs.add_endorsement(endorsement("1", q.uuid, vec![]));

        let (committed, _) = qs.check_state(q.uuid);
        assert!(committed);
        assert_eq!(qs.queries[&q.uuid].state, QueryState::Committed);
        assert_eq!(
            qs.queries[&r.uuid].state,
            QueryState::Dropped,
            "dependent must be dropped before commit returns"
        );
        assert!(!qs.is_applicable(r.uuid));
    }

    #[test]
    fn expired_dependency_commits_after_checkpoint_drop() {
        // q is expired and not applicable; r is endorsed conditioned on q.
        let q = Query::new(); // zero deadline: long expired
        let mut r = Query::new();
        r.set_timeout(Duration::from_secs(60));

        let mut qs = QueryStore::new(1);
        qs.add_query(q.clone());
        qs.add_query(r.clone());
        qs.add_endorsement(endorsement("1", r.uuid, vec![q.uuid]));

        assert!(qs.is_applicable(r.uuid), "q not applicable, so r's endorsement is valid");

        let (committed, checkpoint) = qs.check_state(r.uuid);
        assert!(!committed, "q is not dropped yet");
        assert_eq!(checkpoint, vec![q.uuid], "q is a checkpoint candidate");

        // The cluster agrees to drop q.
        let (choice, proofs) = qs.checkpoint_choice(&[q.uuid]);
        assert!(choice);
        assert!(proofs.is_empty());
        qs.checkpoint_drop(&[q.uuid]);

        let (committed, _) = qs.check_state(r.uuid);
        assert!(committed, "r commits once its condition is dropped");
    }

    #[test]
    fn checkpoint_choice_vetoes_applicable_query() {
        let q = Query::new();
        let mut qs = QueryStore::new(2);
        qs.add_query(q.clone());
        qs.add_endorsement(endorsement("1", q.uuid, vec![]));
        qs.add_endorsement(endorsement("2", q.uuid, vec![]));

        let (choice, proofs) = qs.checkpoint_choice(&[q.uuid]);
        assert!(!choice);
        assert_eq!(proofs.len(), 3, "query plus both endorsements");
        assert!(matches!(&proofs[0], Proof::Query(p) if p.uuid == q.uuid));
    }

    #[test]
    fn conflicting_requires_local_endorsement_and_pending_state() {
        use pnyx_model::{Opcode, Operation};

        let make = |data: &[u8]| {
            let mut q = Query::new();
            q.operations = vec![Operation {
                key: "k".into(),
                op: Opcode::Set,
                data: data.to_vec(),
            }];
            q
        };

        let mine = make(b"A");
        let other = make(b"B");

        let mut qs = QueryStore::new(1);
        qs.add_query(other.clone());
        assert!(qs.get_conflicting(&mine).is_empty(), "not endorsed yet");

        qs.endorse(other.uuid);
        let conflicts = qs.get_conflicting(&mine);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].uuid, other.uuid);

        qs.drop_query(other.uuid);
        assert!(qs.get_conflicting(&mine).is_empty(), "dropped queries do not conflict");
    }

    #[test]
    fn condition_cycle_terminates() {
        let a = Query::new();
        let b = Query::new();

        let mut qs = QueryStore::new(1);
        qs.add_query(a.clone());
        qs.add_query(b.clone());
        qs.add_endorsement(endorsement("1", a.uuid, vec![b.uuid]));
        qs.add_endorsement(endorsement("1", b.uuid, vec![a.uuid]));

        // Whatever the verdict, evaluation must terminate.
        let _ = qs.is_applicable(a.uuid);
        let _ = qs.is_applicable(b.uuid);
    }

    #[test]
    fn concurrent_adds_keep_one_winner() {
        // n queries, m endorsements each; query #i is conditioned on every
        // earlier query, so only the first can ever be applicable.
        let n = 40;
        let m = 16;

        let queries: Vec<Query> = (0..n).map(|_| Query::new()).collect();
        let store = Arc::new(RwLock::new(QueryStore::new(m)));

        let mut handles = Vec::new();
        for query in queries.iter().cloned() {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.write().unwrap().add_query(query);
            }));
        }

        for i in 0..n * m {
            let conditions: Vec<Uuid> = (0..i / m).map(|j| queries[j].uuid).collect();
            let e = endorsement(&format!("{}", i % m), queries[i / m].uuid, conditions);
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut qs = store.write().unwrap();
                qs.add_endorsement(e.clone());
                // Keep caches warm under contention.
                let pending = qs.pending_queries();
                for uuid in pending {
                    qs.is_applicable(uuid);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let mut qs = store.write().unwrap();
        for (i, query) in queries.iter().enumerate() {
            assert_eq!(
                qs.is_applicable(query.uuid),
                i == 0,
                "only the first query may be applicable (#{i})"
            );
        }

        // Dropping the winner promotes the second query.
        qs.drop_query(queries[0].uuid);
        for (i, query) in queries.iter().enumerate() {
            assert_eq!(qs.is_applicable(query.uuid), i == 1, "#{i}");
        }
    }
}
