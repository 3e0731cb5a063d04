//! Wait-free 64-bit accumulator used for per-user traffic bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic byte/stream counter, reset between reporting windows.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Mirrors the source's `NewCounter(num uint64)`, which takes a seed but
    /// always stores 0 regardless of the argument. Preserved verbatim rather
    /// than "fixed" — see DESIGN.md.
    pub fn new(_seed: u64) -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn seed_is_discarded() {
        let c = Counter::new(42);
        assert_eq!(c.value(), 0);
    }

    #[test]
    fn add_and_value_roundtrip() {
        let c = Counter::new(0);
        c.add(5);
        c.add(10);
        assert_eq!(c.value(), 15);
    }

    #[test]
    fn reset_returns_to_zero() {
        let c = Counter::new(0);
        c.add(100);
        c.reset();
        assert_eq!(c.value(), 0);
    }

    #[test]
    fn concurrent_adds_are_exact() {
        let c = Arc::new(Counter::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        c.add(1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(c.value(), 80_000);
    }
}
