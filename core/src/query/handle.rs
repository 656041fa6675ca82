//! Inbound query responder handle
//!
//! Delivered to the user alongside every non-internal inbound query: the
//! handle's `respond` method encodes a response at or under
//! `QueryResponseSizeLimit` and returns it to the origin, invoked at most
//! once and only before the deadline. Encapsulates the deadline as a value
//! the handle itself enforces, rather than leaving the caller to check
//! `Instant::now()` by hand.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{encode_envelope, encode_ip, encode_relay, MessageType, QueryResponseMessage};
use crate::error::{MeshError, Result};
use crate::transport::TransportHandle;

/// Handed to the user's query handler so it can respond to the query's
/// origin (directly, plus `relay_factor` redundant hops) at most once.
pub struct QueryHandle {
    transport: Arc<dyn TransportHandle>,
    id: u64,
    origin: SocketAddr,
    relay_targets: Vec<(String, SocketAddr)>,
    response_size_limit: usize,
    deadline: Instant,
    responded: AtomicBool,
}

impl QueryHandle {
    pub fn new(
        transport: Arc<dyn TransportHandle>,
        id: u64,
        origin: SocketAddr,
        relay_targets: Vec<(String, SocketAddr)>,
        response_size_limit: usize,
        deadline: Instant,
    ) -> Self {
        Self {
            transport,
            id,
            origin,
            relay_targets,
            response_size_limit,
            deadline,
            responded: AtomicBool::new(false),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Encode and unicast `payload` back to the query's origin, fanning a
    /// relay copy out to every precomputed relay target. Returns an error if
    /// already called once, or if `payload` exceeds the size limit; silently
    /// no-ops past the deadline — a response arriving past deadline is
    /// dropped and never surfaced.
    pub async fn respond(&self, payload: Vec<u8>) -> Result<()> {
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(MeshError::InvalidState {
                operation: "Query::respond",
                state: "already responded",
            });
        }
        if payload.len() > self.response_size_limit {
            return Err(MeshError::SizeLimitExceeded {
                what: "query response",
                size: payload.len(),
                limit: self.response_size_limit,
            });
        }
        if Instant::now() > self.deadline {
            return Ok(());
        }

        let local = self.transport.local_addr();
        let msg = QueryResponseMessage {
            id: self.id,
            from_ip: encode_ip(local.ip()),
            from_port: local.port(),
            payload,
            ack: false,
        };
        let bytes = encode_envelope(MessageType::QueryResponse, &msg)?;
        let _ = self.transport.send_to(self.origin, bytes.clone()).await;

        for (name, addr) in &self.relay_targets {
            if let Ok(relayed) = encode_relay(self.origin, name, bytes.clone()) {
                let _ = self.transport.send_to(*addr, relayed).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingTransport {
        addr: SocketAddr,
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl TransportHandle for RecordingTransport {
        async fn join(&self, _addresses: &[SocketAddr], _ignore_old: bool) -> Result<usize> {
            Ok(0)
        }
        async fn broadcast_leave(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
        async fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap().push((addr, bytes));
            Ok(())
        }
        async fn reconnect(&self, _name: &str, _addr: SocketAddr) -> Result<()> {
            Ok(())
        }
    }

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:7946").parse().unwrap()
    }

    #[tokio::test]
    async fn respond_sends_directly_and_to_every_relay_target() {
        let transport = Arc::new(RecordingTransport {
            addr: addr(1),
            sent: Mutex::new(Vec::new()),
        });
        let handle = QueryHandle::new(
            transport.clone(),
            7,
            addr(2),
            vec![("relay-1".into(), addr(3))],
            1024,
            Instant::now() + Duration::from_secs(5),
        );
        handle.respond(b"pong".to_vec()).await.unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, addr(2));
        assert_eq!(sent[1].0, addr(3));
    }

    #[tokio::test]
    async fn respond_can_only_be_called_once() {
        let transport = Arc::new(RecordingTransport {
            addr: addr(1),
            sent: Mutex::new(Vec::new()),
        });
        let handle = QueryHandle::new(
            transport,
            7,
            addr(2),
            Vec::new(),
            1024,
            Instant::now() + Duration::from_secs(5),
        );
        handle.respond(b"a".to_vec()).await.unwrap();
        let err = handle.respond(b"b".to_vec()).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn respond_past_deadline_is_silently_dropped() {
        let transport = Arc::new(RecordingTransport {
            addr: addr(1),
            sent: Mutex::new(Vec::new()),
        });
        let handle = QueryHandle::new(transport.clone(), 7, addr(2), Vec::new(), 1024, Instant::now());
        handle.respond(b"late".to_vec()).await.unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let transport = Arc::new(RecordingTransport {
            addr: addr(1),
            sent: Mutex::new(Vec::new()),
        });
        let handle = QueryHandle::new(
            transport,
            7,
            addr(2),
            Vec::new(),
            4,
            Instant::now() + Duration::from_secs(5),
        );
        let err = handle.respond(vec![0u8; 5]).await.unwrap_err();
        assert!(matches!(err, MeshError::SizeLimitExceeded { .. }));
    }
}
