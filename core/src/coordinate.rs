//! Network-coordinate client (optional)
//!
//! A simple EWMA-RTT cache stands in for full Vivaldi coordinate math: only
//! `update`/`forget` hooks consumed by the ping-complete callback and the
//! reaper are required, not a specific coordinate algebra.

use std::collections::HashMap;

use parking_lot::RwLock;

const EWMA_ALPHA: f64 = 0.2;

/// Per-member smoothed round-trip time, keyed by member name.
#[derive(Default)]
pub struct CoordinateClient {
    rtts: RwLock<HashMap<String, f64>>,
}

impl CoordinateClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a freshly observed RTT (ms) into the smoothed estimate for
    /// `name`.
    pub fn update(&self, name: &str, rtt_ms: f64) {
        let mut rtts = self.rtts.write();
        rtts.entry(name.to_string())
            .and_modify(|v| *v = EWMA_ALPHA * rtt_ms + (1.0 - EWMA_ALPHA) * *v)
            .or_insert(rtt_ms);
    }

    pub fn estimate(&self, name: &str) -> Option<f64> {
        self.rtts.read().get(name).copied()
    }

    /// Drop cached state for a reaped member.
    pub fn forget(&self, name: &str) {
        self.rtts.write().remove(name);
    }

    pub fn len(&self) -> usize {
        self.rtts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
