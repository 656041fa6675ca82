//! Lamport logical clock
//!
//! Three independent instances are held by [`crate::node::Node`]: one for
//! membership status, one for user events, one for queries. Each is a single
//! atomic word, lock-free, so `time`, `increment`, and `witness` interleave
//! safely without a mutex.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic logical counter.
///
/// `Time()` reads never decrease. `Increment()` always produces a value one
/// greater than any value previously read or witnessed by this clock.
/// `Witness(t)` folds in an externally observed time `t`, advancing the
/// clock to `t + 1` only if that is strictly greater than the current value.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Read the current time without advancing it.
    pub fn time(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Atomically advance the clock by one and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Witness an externally observed logical time `t`, advancing the clock
    /// to `max(current, t + 1)`. Returns the resulting time.
    pub fn witness(&self, t: u64) -> u64 {
        loop {
            let current = self.value.load(Ordering::SeqCst);
            if t < current {
                return current;
            }
            let next = t + 1;
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn increment_is_strictly_monotonic() {
        let clock = LamportClock::new();
        let a = clock.increment();
        let b = clock.increment();
        assert!(b > a);
        assert_eq!(clock.time(), b);
    }

    #[test]
    fn witness_advances_only_when_strictly_greater() {
        let clock = LamportClock::new();
        clock.increment(); // time = 1
        assert_eq!(clock.witness(0), 1); // 0 < 1, no-op
        assert_eq!(clock.witness(5), 6); // 5 >= 1, advance to 6
        assert_eq!(clock.time(), 6);
        assert_eq!(clock.witness(6), 7); // equal also advances (t+1 > current)
    }

    #[test]
    fn concurrent_increments_produce_distinct_values() {
        let clock = Arc::new(LamportClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen.push(clock.increment());
                }
                seen
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before, "increments must be distinct");
        assert_eq!(clock.time(), 800);
    }

    #[test]
    fn time_is_non_decreasing_under_interleaving() {
        let clock = LamportClock::new();
        let mut last = clock.time();
        for i in 0..50 {
            let next = if i % 2 == 0 {
                clock.increment()
            } else {
                clock.witness(i)
            };
            assert!(next >= last);
            last = clock.time();
        }
    }
}
