//! Outbound query response tracking
//!
//! A deadline is modeled as a small guard value rather than a wall-clock
//! field read ad hoc by callers: [`QueryResponse::close`] is the single
//! place that closes both channels, driven by one watcher task per query
//! spawned by the caller.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A response delivered to the query origin.
#[derive(Debug, Clone)]
pub struct QueryResponseItem {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

const CHANNEL_CAPACITY: usize = 64;

struct Channels<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T> Channels<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    fn try_send(&self, item: T) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.try_send(item);
        }
    }

    /// Drop the sender half, so a caller blocked on `rx.recv()` sees the
    /// channel close instead of hanging past the deadline.
    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Per-query ack/response registry.
///
/// Duplicate acks/responses from the same address are dropped; channel
/// overflow drops the newest duplicate rather than blocking the sender.
pub struct QueryResponse {
    pub deadline: Instant,
    acks: Channels<SocketAddr>,
    responses: Channels<QueryResponseItem>,
    acks_seen: Mutex<HashSet<SocketAddr>>,
    responders_seen: Mutex<HashSet<SocketAddr>>,
    closed: Mutex<bool>,
}

impl QueryResponse {
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            acks: Channels::new(),
            responses: Channels::new(),
            acks_seen: Mutex::new(HashSet::new()),
            responders_seen: Mutex::new(HashSet::new()),
            closed: Mutex::new(false),
        }
    }

    /// Take ownership of the acks receiver. Callable once.
    pub fn take_acks(&self) -> Option<mpsc::Receiver<SocketAddr>> {
        self.acks.rx.lock().take()
    }

    /// Take ownership of the responses receiver. Callable once.
    pub fn take_responses(&self) -> Option<mpsc::Receiver<QueryResponseItem>> {
        self.responses.rx.lock().take()
    }

    pub fn finished(&self) -> bool {
        *self.closed.lock() || Instant::now() >= self.deadline
    }

    /// Record an ack from `from`, if not already seen and not past deadline.
    pub fn deliver_ack(&self, from: SocketAddr) {
        if self.finished() {
            return;
        }
        let mut seen = self.acks_seen.lock();
        if !seen.insert(from) {
            return;
        }
        self.acks.try_send(from);
    }

    /// Record a response from `from`, if not already seen and not past
    /// deadline. Duplicate detection means relayed duplicates never surface
    /// twice.
    pub fn deliver_response(&self, from: SocketAddr, payload: Vec<u8>) {
        if self.finished() {
            return;
        }
        let mut seen = self.responders_seen.lock();
        if !seen.insert(from) {
            return;
        }
        self.responses.try_send(QueryResponseItem { from, payload });
    }

    /// Close both channels. Idempotent. Called by the single deadline
    /// watcher task, never ad hoc by readers. Drops each sender so a caller
    /// parked on `rx.recv()` past the deadline observes the channel close
    /// rather than hanging forever.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.acks.close();
        self.responses.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:7946").parse().unwrap()
    }

    #[test]
    fn duplicate_response_from_same_responder_is_dropped() {
        let qr = QueryResponse::new(Instant::now() + Duration::from_secs(5));
        let mut rx = qr.take_responses().unwrap();
        qr.deliver_response(addr(1), b"a".to_vec());
        qr.deliver_response(addr(1), b"b".to_vec());
        let first = rx.try_recv().unwrap();
        assert_eq!(first.from, addr(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_query_drops_late_deliveries() {
        let qr = QueryResponse::new(Instant::now() + Duration::from_secs(5));
        let mut rx = qr.take_responses().unwrap();
        qr.close();
        qr.deliver_response(addr(1), b"a".to_vec());
        assert!(rx.try_recv().is_err());
        assert!(qr.finished());
    }

    #[test]
    fn finished_becomes_true_after_deadline_elapses() {
        let qr = QueryResponse::new(Instant::now());
        assert!(qr.finished());
    }

    #[tokio::test]
    async fn close_drops_the_sender_so_recv_returns_none() {
        let qr = QueryResponse::new(Instant::now() + Duration::from_secs(5));
        let mut responses = qr.take_responses().unwrap();
        let mut acks = qr.take_acks().unwrap();
        qr.close();
        assert!(responses.recv().await.is_none());
        assert!(acks.recv().await.is_none());
    }
}
