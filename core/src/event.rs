//! User event buffer and dedup
//!
//! Guarded by its own lock, held independently of the member lock. Lock
//! order is query → event → member → broadcast; this module never reaches
//! into the member store while holding its own lock.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Size cap enforced at send time.
pub const USER_EVENT_SIZE_LIMIT_DEFAULT: usize = 512;

/// A delivered user event.
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub name: String,
    pub payload: Vec<u8>,
    pub ltime: u64,
    pub coalesce: bool,
}

struct EventBufferInner {
    /// ltime -> distinct events observed at that time.
    slots: BTreeMap<u64, Vec<UserEvent>>,
    capacity: usize,
}

/// Ring of the last `capacity` distinct event-clock slots.
pub struct EventBuffer {
    inner: Mutex<EventBufferInner>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EventBufferInner {
                slots: BTreeMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Insert `event` if it is new: its ltime is not older than the oldest
    /// kept slot, and no identical event is already recorded at that ltime.
    /// Returns `true` if the event was accepted and should be delivered /
    /// rebroadcast.
    pub fn insert(&self, event: UserEvent) -> bool {
        let mut inner = self.inner.lock();

        if let Some((&oldest, _)) = inner.slots.iter().next() {
            if inner.slots.len() >= inner.capacity && event.ltime < oldest {
                return false;
            }
        }

        let slot = inner.slots.entry(event.ltime).or_default();
        if slot
            .iter()
            .any(|e| e.name == event.name && e.payload == event.payload)
        {
            return false;
        }
        slot.push(event);

        while inner.slots.len() > inner.capacity {
            let oldest_key = *inner.slots.keys().next().unwrap();
            inner.slots.remove(&oldest_key);
        }
        true
    }

    pub fn len_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn oldest_ltime(&self) -> Option<u64> {
        self.inner.lock().slots.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(name: &str, payload: &[u8], ltime: u64) -> UserEvent {
        UserEvent {
            name: name.to_string(),
            payload: payload.to_vec(),
            ltime,
            coalesce: false,
        }
    }

    #[test]
    fn accepts_new_events_and_rejects_duplicates_at_same_ltime() {
        let buf = EventBuffer::new(4);
        assert!(buf.insert(ev("deploy", b"v1", 1)));
        assert!(!buf.insert(ev("deploy", b"v1", 1)));
        assert!(buf.insert(ev("deploy", b"v2", 1)));
    }

    #[test]
    fn evicts_smallest_ltime_when_capacity_exceeded() {
        let buf = EventBuffer::new(2);
        assert!(buf.insert(ev("a", b"x", 1)));
        assert!(buf.insert(ev("b", b"x", 2)));
        assert!(buf.insert(ev("c", b"x", 3)));
        assert_eq!(buf.len_slots(), 2);
        assert_eq!(buf.oldest_ltime(), Some(2));
    }

    #[test]
    fn rejects_event_older_than_oldest_kept_slot() {
        let buf = EventBuffer::new(2);
        buf.insert(ev("a", b"x", 5));
        buf.insert(ev("b", b"x", 6));
        assert!(!buf.insert(ev("c", b"x", 1)));
    }
}
