//! Outbound query tracking and inbound dedup (component H)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::LamportClock;
use crate::error::{MeshError, Result};
use crate::query::response::QueryResponse;

/// The query engine: one independent query-clock, a registry of in-flight
/// `QueryResponse`s the local node originated, and a sliding window of seen
/// ids for inbound dedup.
pub struct QueryEngine {
    clock: LamportClock,
    responses: Mutex<HashMap<u64, Arc<QueryResponse>>>,
    seen_inbound: Mutex<BTreeMap<u64, HashSet<u64>>>,
    inbound_window: usize,
}

impl QueryEngine {
    pub fn new(inbound_window: usize) -> Self {
        Self {
            clock: LamportClock::new(),
            responses: Mutex::new(HashMap::new()),
            seen_inbound: Mutex::new(BTreeMap::new()),
            inbound_window: inbound_window.max(1),
        }
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Validate size, assign an id unique per query-clock slot, and register
    /// the response: assigns an id unique per-sender-per-query-clock-slot,
    /// increments the query-clock, and captures the deadline.
    pub fn prepare_query(
        &self,
        wire_size: usize,
        size_limit: usize,
        timeout: Duration,
    ) -> Result<(u64, Arc<QueryResponse>)> {
        if wire_size > size_limit {
            return Err(MeshError::SizeLimitExceeded {
                what: "query",
                size: wire_size,
                limit: size_limit,
            });
        }
        let id = self.clock.increment();
        let response = Arc::new(QueryResponse::new(Instant::now() + timeout));
        self.responses.lock().insert(id, response.clone());
        Ok((id, response))
    }

    pub fn response_for(&self, id: u64) -> Option<Arc<QueryResponse>> {
        self.responses.lock().get(&id).cloned()
    }

    /// Drop a completed/expired query's registry entry.
    pub fn forget(&self, id: u64) {
        self.responses.lock().remove(&id);
    }

    /// Close and forget every registered query past its deadline. Driven by
    /// a single watcher task rather than each reader checking wall-clock
    /// fields itself.
    pub fn close_expired(&self) -> usize {
        let mut responses = self.responses.lock();
        let before = responses.len();
        responses.retain(|_, resp| {
            if resp.finished() {
                resp.close();
                false
            } else {
                true
            }
        });
        before - responses.len()
    }

    /// Witness `ltime`, then record-and-check `id` in that slot's seen set.
    /// Returns `true` if this is the first time `id` was observed at
    /// `ltime` (i.e. it should be processed), `false` if it's a duplicate.
    pub fn accept_inbound(&self, ltime: u64, id: u64) -> bool {
        self.clock.witness(ltime);
        let mut seen = self.seen_inbound.lock();
        let slot = seen.entry(ltime).or_default();
        if !slot.insert(id) {
            return false;
        }
        while seen.len() > self.inbound_window {
            let oldest = *seen.keys().next().unwrap();
            seen.remove(&oldest);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_query_is_rejected_before_assigning_an_id() {
        let engine = QueryEngine::new(16);
        let err = engine
            .prepare_query(2000, 1024, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, MeshError::SizeLimitExceeded { .. }));
    }

    #[test]
    fn duplicate_inbound_id_at_same_slot_is_rejected() {
        let engine = QueryEngine::new(16);
        assert!(engine.accept_inbound(5, 1));
        assert!(!engine.accept_inbound(5, 1));
        assert!(engine.accept_inbound(5, 2));
    }

    #[test]
    fn inbound_window_evicts_oldest_slot() {
        let engine = QueryEngine::new(2);
        engine.accept_inbound(1, 1);
        engine.accept_inbound(2, 1);
        engine.accept_inbound(3, 1);
        let seen = engine.seen_inbound.lock();
        assert!(!seen.contains_key(&1));
    }
}
