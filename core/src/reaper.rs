//! Reaper / reconnector / flap detector (component K)
//!
//! The reconnect rate limiter follows a per-key last-attempt-instant
//! pattern, the same shape used elsewhere in this codebase for rate-gating
//! per-endpoint work, reduced to the one thing this component needs: "don't
//! reconnect to the same name twice within `ReconnectInterval`".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::coordinate::CoordinateClient;
use crate::member::{Member, MemberStore};

/// Result of one reaper sweep, handed back to the caller to drive events
/// and reconnect probes.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    pub reaped: Vec<String>,
    pub reconnect_candidates: Vec<Member>,
    pub flapped: Vec<String>,
}

/// Gate on reconnect attempts per member name.
struct ReconnectGate {
    last_attempt: Mutex<HashMap<String, Instant>>,
}

impl ReconnectGate {
    fn new() -> Self {
        Self {
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, name: &str, interval: Duration) -> bool {
        let mut map = self.last_attempt.lock();
        let now = Instant::now();
        match map.get(name) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                map.insert(name.to_string(), now);
                true
            }
        }
    }

    fn forget(&self, name: &str) {
        self.last_attempt.lock().remove(name);
    }
}

/// Tracks recent leave-times for flap detection, independent of the member
/// store (a reaped member's leave-time is gone once it's removed, but a
/// flap needs to be detected on the *next* join, which arrives after reap).
struct FlapTracker {
    last_leave: Mutex<HashMap<String, Instant>>,
}

impl FlapTracker {
    fn new() -> Self {
        Self {
            last_leave: Mutex::new(HashMap::new()),
        }
    }

    fn record_leave(&self, name: &str) {
        self.last_leave.lock().insert(name.to_string(), Instant::now());
    }

    /// True if `name` left within `flap_timeout` of now.
    fn is_flap(&self, name: &str, flap_timeout: Duration) -> bool {
        self.last_leave
            .lock()
            .get(name)
            .is_some_and(|t| Instant::now().duration_since(*t) <= flap_timeout)
    }
}

/// Periodic GC and reconnect scheduler for failed/left members.
pub struct Reaper {
    gate: ReconnectGate,
    flaps: FlapTracker,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Reaper {
    pub fn new() -> Self {
        Self {
            gate: ReconnectGate::new(),
            flaps: FlapTracker::new(),
        }
    }

    /// Record that a member just transitioned to Failed/Left, for flap
    /// detection on its next authoritative join.
    pub fn note_departure(&self, name: &str) {
        self.flaps.record_leave(name);
    }

    /// Check whether an authoritative join for `name` is a flap.
    pub fn check_flap(&self, name: &str, flap_timeout: Duration) -> bool {
        self.flaps.is_flap(name, flap_timeout)
    }

    /// One reap sweep: GC members past their timeout, schedule reconnects
    /// for the rest, rate-limited by `reconnect_interval`.
    pub fn sweep(
        &self,
        members: &MemberStore,
        coordinates: &CoordinateClient,
        reconnect_timeout: Duration,
        tombstone_timeout: Duration,
        reconnect_interval: Duration,
    ) -> ReapOutcome {
        let mut outcome = ReapOutcome::default();
        let now = Instant::now();

        for name in members.failed_names() {
            let Some(member) = members.get(&name) else {
                continue;
            };
            let age = member.leave_time.map(|t| now.duration_since(t));
            match age {
                Some(age) if age > reconnect_timeout => {
                    members.reap(&name);
                    coordinates.forget(&name);
                    self.gate.forget(&name);
                    outcome.reaped.push(name);
                }
                _ => {
                    if self.gate.allow(&name, reconnect_interval) {
                        outcome.reconnect_candidates.push(member);
                    }
                }
            }
        }

        for name in members.left_names() {
            let Some(member) = members.get(&name) else {
                continue;
            };
            if let Some(age) = member.leave_time.map(|t| now.duration_since(t)) {
                if age > tombstone_timeout {
                    members.reap(&name);
                    coordinates.forget(&name);
                    self.gate.forget(&name);
                    outcome.reaped.push(name);
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:7946".parse().unwrap()
    }

    #[test]
    fn failed_past_reconnect_timeout_is_reaped() {
        let members = MemberStore::new("self", addr());
        members.handle_authoritative_join("x", addr(), 0);
        members.handle_authoritative_fail("x", 1);
        let reaper = Reaper::new();
        let coords = CoordinateClient::new();
        let outcome = reaper.sweep(
            &members,
            &coords,
            Duration::from_secs(0),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );
        assert!(outcome.reaped.contains(&"x".to_string()));
        assert!(members.get("x").is_none());
    }

    #[test]
    fn young_failed_member_is_reconnect_candidate_not_reaped() {
        let members = MemberStore::new("self", addr());
        members.handle_authoritative_join("x", addr(), 0);
        members.handle_authoritative_fail("x", 1);
        let reaper = Reaper::new();
        let coords = CoordinateClient::new();
        let outcome = reaper.sweep(
            &members,
            &coords,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );
        assert!(outcome.reaped.is_empty());
        assert_eq!(outcome.reconnect_candidates.len(), 1);
    }

    #[test]
    fn reconnect_gate_rate_limits_repeat_attempts() {
        let gate = ReconnectGate::new();
        assert!(gate.allow("x", Duration::from_secs(60)));
        assert!(!gate.allow("x", Duration::from_secs(60)));
    }

    #[test]
    fn flap_detected_within_window() {
        let tracker = FlapTracker::new();
        tracker.record_leave("x");
        assert!(tracker.is_flap("x", Duration::from_secs(60)));
        assert!(!tracker.is_flap("y", Duration::from_secs(60)));
    }
}
