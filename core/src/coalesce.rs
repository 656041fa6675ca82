//! Event coalescer
//!
//! Rather than a generic batcher parameterized by a handler trait object,
//! coalescable events are a tagged variant and coalescing behavior is a
//! trait implemented per variant.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::UserEvent;
use crate::member::MemberEventKind;

/// A coalescable event: either a user event or a membership event. Only
/// these two kinds are coalesced; queries are never coalesced.
#[derive(Debug, Clone)]
pub enum CoalescableEvent {
    User(UserEvent),
    Member { kind: MemberEventKind, name: String },
}

impl CoalescableEvent {
    fn key(&self) -> String {
        match self {
            Self::User(e) => format!("user:{}", e.name),
            Self::Member { kind, name } => format!("member:{kind:?}:{name}"),
        }
    }
}

/// Per-kind coalescing behavior, implemented once per variant rather than
/// the old generic-handler-type pattern.
pub trait Coalescer {
    /// Should this event be coalesced at all (vs. passed straight through)?
    fn handle(&self, event: &CoalescableEvent) -> bool;

    /// Merge `next` into `prev`, keeping only the most recent state.
    fn coalesce(&self, _prev: CoalescableEvent, next: CoalescableEvent) -> CoalescableEvent {
        next
    }
}

/// Default coalescer: coalesces `UserEvent`s marked `coalesce`, and member
/// events unconditionally (only the latest status per name matters).
pub struct DefaultCoalescer;

impl Coalescer for DefaultCoalescer {
    fn handle(&self, event: &CoalescableEvent) -> bool {
        match event {
            CoalescableEvent::User(e) => e.coalesce,
            CoalescableEvent::Member { .. } => true,
        }
    }
}

/// Batches coalescable events over a quiescent window: each new event
/// resets the per-key quiescent timer; a key flushes once `quiescent`
/// elapses since its last update, or unconditionally after `period`.
pub struct EventCoalescer<C: Coalescer> {
    coalescer: C,
    period: Duration,
    quiescent: Duration,
    pending: HashMap<String, (CoalescableEvent, Instant, Instant)>,
}

impl<C: Coalescer> EventCoalescer<C> {
    pub fn new(coalescer: C, period: Duration, quiescent: Duration) -> Self {
        Self {
            coalescer,
            period,
            quiescent,
            pending: HashMap::new(),
        }
    }

    /// Offer an event. Returns `Some(event)` immediately if it should pass
    /// straight through (not coalescable), otherwise buffers it and returns
    /// `None`.
    pub fn offer(&mut self, event: CoalescableEvent) -> Option<CoalescableEvent> {
        if !self.coalescer.handle(&event) {
            return Some(event);
        }
        let key = event.key();
        let now = Instant::now();
        match self.pending.remove(&key) {
            Some((prev, first_seen, _last_seen)) => {
                let merged = self.coalescer.coalesce(prev, event);
                self.pending.insert(key, (merged, first_seen, now));
            }
            None => {
                self.pending.insert(key, (event, now, now));
            }
        }
        None
    }

    /// Drain every key whose quiescent window has elapsed or whose total
    /// buffered age exceeds `period`.
    pub fn drain_ready(&mut self) -> Vec<CoalescableEvent> {
        let now = Instant::now();
        let mut ready_keys = Vec::new();
        for (key, (_, first_seen, last_seen)) in &self.pending {
            if now.duration_since(*last_seen) >= self.quiescent
                || now.duration_since(*first_seen) >= self.period
            {
                ready_keys.push(key.clone());
            }
        }
        ready_keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|(e, _, _)| e))
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_event(name: &str, ltime: u64, coalesce: bool) -> CoalescableEvent {
        CoalescableEvent::User(UserEvent {
            name: name.to_string(),
            payload: b"x".to_vec(),
            ltime,
            coalesce,
        })
    }

    #[test]
    fn non_coalescable_event_passes_through_immediately() {
        let mut c = EventCoalescer::new(
            DefaultCoalescer,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        let event = user_event("deploy", 1, false);
        assert!(c.offer(event).is_some());
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn coalescable_events_merge_under_one_key() {
        let mut c = EventCoalescer::new(
            DefaultCoalescer,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(c.offer(user_event("deploy", 1, true)).is_none());
        assert!(c.offer(user_event("deploy", 2, true)).is_none());
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn drain_ready_is_empty_before_quiescent_elapses() {
        let mut c = EventCoalescer::new(
            DefaultCoalescer,
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        c.offer(user_event("deploy", 1, true));
        assert!(c.drain_ready().is_empty());
    }
}
