//! Name-conflict resolver
//!
//! Only the local node initiates resolution, and only when the transport
//! reports a conflict naming the local node. Conflicts between two remote
//! nodes are logged by the caller and never reach this module.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// `majority = (responses / 2) + 1`.
pub fn majority(responses: usize) -> usize {
    responses / 2 + 1
}

/// Outcome of a self-conflict vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    RemainAlive,
    Shutdown,
}

/// Decide the outcome of a self-conflict vote given the addresses reported
/// by every responder and the local node's own address. Zero responses
/// shuts the node down (`0 < majority(0) == 1`).
pub fn resolve(local_addr: SocketAddr, responder_addrs: &[SocketAddr]) -> ConflictOutcome {
    let matching = responder_addrs.iter().filter(|a| **a == local_addr).count();
    if matching >= majority(responder_addrs.len()) {
        ConflictOutcome::RemainAlive
    } else {
        ConflictOutcome::Shutdown
    }
}

/// Log-only handling for a conflict between two remote nodes: only log a
/// warning, no resolution is initiated locally.
pub fn log_remote_conflict(existing: &str, other: &str) {
    warn!(existing, other, "name conflict between two remote nodes");
}

/// Default timeout waiting for conflict-query responses before calling
/// [`resolve`], mirroring a query's own deadline handling.
pub const DEFAULT_CONFLICT_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:7946").parse().unwrap()
    }

    #[test]
    fn majority_of_five_is_three() {
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn four_of_five_matching_remains_alive() {
        let local = addr(1);
        let responders = [addr(1), addr(1), addr(1), addr(1), addr(9)];
        assert_eq!(resolve(local, &responders), ConflictOutcome::RemainAlive);
    }

    #[test]
    fn two_of_four_matching_shuts_down() {
        let local = addr(1);
        let responders = [addr(1), addr(1), addr(9), addr(9)];
        assert_eq!(resolve(local, &responders), ConflictOutcome::Shutdown);
    }

    #[test]
    fn zero_responders_shuts_down() {
        let local = addr(1);
        assert_eq!(resolve(local, &[]), ConflictOutcome::Shutdown);
    }
}
