//! Transport delegate contract
//!
//! A cyclic delegate graph (transport owns delegate owns node owns
//! transport) is easy to fall into here and worth avoiding deliberately.
//! The dependency runs one way: [`Node`](crate::node::Node) implements
//! [`MembershipSink`] and hands it to the transport as a narrow trait
//! object; the transport itself is held by the node behind the opaque
//! [`TransportHandle`] trait. Neither side owns the other.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::codec::PushPullBody;
use crate::error::Result;

/// Callbacks the core supplies to the gossip transport.
#[async_trait]
pub trait MembershipSink: Send + Sync {
    /// Encoded tags for outbound probes, capped at `limit` bytes. Exceeding
    /// `limit` is fatal to the caller.
    fn node_meta(&self, limit: usize) -> Result<Vec<u8>>;

    /// Dispatch one decoded inbound message.
    async fn notify_msg(&self, bytes: &[u8]);

    /// Drain the broadcast queues respecting `overhead + limit` bytes.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Produce this node's push/pull anti-entropy payload.
    fn local_state(&self, join: bool) -> PushPullBody;

    /// Merge a peer's push/pull payload into local state.
    async fn merge_remote_state(&self, remote: PushPullBody, join: bool);

    async fn notify_join(&self, name: &str, addr: SocketAddr);
    async fn notify_leave(&self, name: &str);
    async fn notify_update(&self, name: &str, addr: SocketAddr);
    async fn notify_conflict(&self, existing: &str, other: &str);
    async fn notify_alive(&self, name: &str, addr: SocketAddr) -> Result<()>;
    async fn notify_ping_complete(&self, name: &str, rtt_ms: f64, ack_payload: &[u8]);
}

/// Opaque handle to the underlying SWIM-style transport, held by the node
/// rather than the other way around.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn join(&self, addresses: &[SocketAddr], ignore_old: bool) -> Result<usize>;
    async fn broadcast_leave(&self) -> Result<()>;
    async fn shutdown(&self);
    fn local_addr(&self) -> SocketAddr;

    /// Unicast a pre-framed envelope directly to `addr`, bypassing the
    /// broadcast queues. Query acks, query responses, and relay hops are
    /// point-to-point rather than gossiped.
    async fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()>;

    /// Probe a `Failed` member outside the normal gossip/failure-detection
    /// cycle, rate-limited and scheduled by the reaper. A transport that has
    /// nothing extra to do beyond its regular probing can implement this as
    /// a no-op returning `Ok(())`.
    async fn reconnect(&self, name: &str, addr: SocketAddr) -> Result<()>;
}
