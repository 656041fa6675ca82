//! Retransmit-limited gossip outbox
//!
//! Three independent queues — membership, user-event, query — each guarded
//! by its own internal mutex, never the member/event/query locks.

use std::sync::Mutex;

use tokio::sync::oneshot;

/// A pending broadcast. `unique_id` lets a fresher entry for the same
/// logical key (e.g. a member name) supersede an older one still in queue.
pub struct BroadcastEntry {
    pub bytes: Vec<u8>,
    pub unique_id: String,
    pub notify_on_drain: Option<oneshot::Sender<()>>,
    transmit_count: u32,
}

impl BroadcastEntry {
    pub fn new(bytes: Vec<u8>, unique_id: impl Into<String>) -> Self {
        Self {
            bytes,
            unique_id: unique_id.into(),
            notify_on_drain: None,
            transmit_count: 0,
        }
    }

    pub fn with_notify(mut self, tx: oneshot::Sender<()>) -> Self {
        self.notify_on_drain = Some(tx);
        self
    }

    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }
}

/// One retransmit-limited queue. Newer entries sharing a `unique_id`
/// supersede older ones; entries are evicted once `transmit_count` reaches
/// the retransmit limit `Retransmit(N)`, computed by the caller from cluster
/// size and handed in as `retransmit_limit`.
pub struct BroadcastQueue {
    inner: Mutex<Vec<BroadcastEntry>>,
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue `entry`, superseding any existing entry with the same
    /// `unique_id`. A superseded entry's `notify_on_drain` fires immediately
    /// since it will never itself be drained.
    pub fn queue(&self, entry: BroadcastEntry) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(pos) = guard.iter().position(|e| e.unique_id == entry.unique_id) {
            let old = guard.remove(pos);
            if let Some(tx) = old.notify_on_drain {
                let _ = tx.send(());
            }
        }
        guard.push(entry);
    }

    /// Drain entries in FIFO order up to `overhead + limit` total bytes,
    /// bumping each drained entry's transmit count and evicting it once it
    /// reaches `retransmit_limit`. Returns the drained wire bytes.
    pub fn get_broadcasts(
        &self,
        overhead: usize,
        limit: usize,
        retransmit_limit: u32,
    ) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        let mut budget = limit;
        let mut out = Vec::new();
        let mut keep = Vec::new();

        for mut entry in guard.drain(..) {
            let cost = entry.bytes.len() + overhead;
            if cost > budget {
                keep.push(entry);
                continue;
            }
            budget -= cost;
            out.push(entry.bytes.clone());
            entry.transmit_count += 1;
            if entry.transmit_count >= retransmit_limit {
                if let Some(tx) = entry.notify_on_drain.take() {
                    let _ = tx.send(());
                }
            } else {
                keep.push(entry);
            }
        }
        *guard = keep;
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three retransmit-limited outboxes: membership, user-event, query.
pub struct BroadcastQueues {
    pub membership: BroadcastQueue,
    pub user_event: BroadcastQueue,
    pub query: BroadcastQueue,
}

impl Default for BroadcastQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastQueues {
    pub fn new() -> Self {
        Self {
            membership: BroadcastQueue::new(),
            user_event: BroadcastQueue::new(),
            query: BroadcastQueue::new(),
        }
    }
}

/// `Retransmit(N)`: the standard SWIM/Serf retransmit multiplier, `ceil(log(N+1)) * mult`.
pub fn retransmit_limit(num_members: usize, mult: u32) -> u32 {
    let n = (num_members as f64 + 1.0).ln().ceil().max(1.0) as u32;
    n * mult.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_entry_supersedes_older_with_same_key() {
        let q = BroadcastQueue::new();
        q.queue(BroadcastEntry::new(b"v1".to_vec(), "node-1"));
        q.queue(BroadcastEntry::new(b"v2".to_vec(), "node-1"));
        assert_eq!(q.len(), 1);
        let drained = q.get_broadcasts(0, 1024, 3);
        assert_eq!(drained, vec![b"v2".to_vec()]);
    }

    #[test]
    fn entry_evicted_after_retransmit_limit() {
        let q = BroadcastQueue::new();
        q.queue(BroadcastEntry::new(b"hello".to_vec(), "a"));
        for _ in 0..2 {
            let drained = q.get_broadcasts(0, 1024, 2);
            assert_eq!(drained.len(), 1);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn byte_budget_is_respected() {
        let q = BroadcastQueue::new();
        q.queue(BroadcastEntry::new(vec![0u8; 100], "a"));
        q.queue(BroadcastEntry::new(vec![0u8; 100], "b"));
        let drained = q.get_broadcasts(0, 150, 5);
        assert_eq!(drained.len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn superseded_entry_notifies_drain_immediately() {
        let q = BroadcastQueue::new();
        let (tx, rx) = oneshot::channel();
        q.queue(BroadcastEntry::new(b"v1".to_vec(), "a").with_notify(tx));
        q.queue(BroadcastEntry::new(b"v2".to_vec(), "a"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn retransmit_limit_grows_with_cluster_size() {
        assert!(retransmit_limit(100, 3) >= retransmit_limit(1, 3));
    }
}
