//! Hot-restart generation counter (spec.md §4.6, C9).
//!
//! `SIGHUP` bumps a single atomic counter. Worker threads compare the
//! generation they last observed against the current one; on divergence
//! they rebuild whatever per-thread state they hold. `SHUTDOWN` is a
//! sentinel generation telling workers to drain and exit instead.

use std::sync::atomic::{AtomicI64, Ordering};

pub const SHUTDOWN: i64 = -1;

pub struct Generation(AtomicI64);

impl Generation {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn current(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Called from the `SIGHUP` handler path: bump and return the new value.
    pub fn bump(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn shutdown(&self) {
        self.0.store(SHUTDOWN, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.current() == SHUTDOWN
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_increments_and_returns_new_value() {
        let gen = Generation::new();
        assert_eq!(gen.current(), 0);
        assert_eq!(gen.bump(), 1);
        assert_eq!(gen.current(), 1);
    }

    #[test]
    fn shutdown_sets_sentinel() {
        let gen = Generation::new();
        gen.shutdown();
        assert!(gen.is_shutdown());
    }
}
