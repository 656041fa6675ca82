//! Intent buffer
//!
//! Advisory join/leave intents received for a name the local
//! [`crate::member::MemberStore`] does not yet know about. Guarded by the
//! same member lock as the store itself, never its own lock.

use std::collections::VecDeque;
use std::time::Instant;

/// Kind of a buffered intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Join,
    Leave,
}

/// An advisory intent buffered because its member is not yet materialized.
#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: IntentKind,
    pub name: String,
    pub ltime: u64,
    pub recorded_at: Instant,
}

/// Ring of recent intents for unknown members, discarded when the member
/// materializes or after `RecentIntentTimeout`.
#[derive(Debug, Default)]
pub struct IntentBuffer {
    entries: VecDeque<Intent>,
}

impl IntentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intent for a name not currently in the member store.
    pub fn record(&mut self, kind: IntentKind, name: impl Into<String>, ltime: u64) {
        self.entries.push_back(Intent {
            kind,
            name: name.into(),
            ltime,
            recorded_at: Instant::now(),
        });
    }

    /// Drop every buffered intent for `name` — called once the member
    /// materializes, since a materialized member's clock supersedes any
    /// buffered advisory state.
    pub fn discard(&mut self, name: &str) {
        self.entries.retain(|i| i.name != name);
    }

    /// Drop intents older than `timeout`.
    pub fn expire(&mut self, timeout: std::time::Duration) {
        let now = Instant::now();
        self.entries
            .retain(|i| now.duration_since(i.recorded_at) <= timeout);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Intent> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn discard_removes_only_matching_name() {
        let mut buf = IntentBuffer::new();
        buf.record(IntentKind::Join, "a", 1);
        buf.record(IntentKind::Leave, "b", 2);
        buf.discard("a");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.iter().next().unwrap().name, "b");
    }

    #[test]
    fn expire_drops_old_entries() {
        let mut buf = IntentBuffer::new();
        buf.record(IntentKind::Join, "a", 1);
        buf.expire(Duration::from_secs(0));
        assert!(buf.is_empty());
    }
}
