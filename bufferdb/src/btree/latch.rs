//! Version latch for optimistic lock coupling.
//!
//! A latch is a single 64-bit word:
//!
//! ```text
//! +-------------------------------+----------+--------+
//! | 63..2 version counter         | 1 obsolete | 0 locked |
//! +-------------------------------+----------+--------+
//! ```
//!
//! Writers set the locked bit with compare-and-swap. Unlocking clears it and
//! bumps the version, so the word changes on every lock/unlock cycle. Readers
//! take a stable (unlocked) version before looking at a node and compare it
//! again afterwards; any difference means a writer got in between and the
//! read must restart.
//!
//! Every wait here is bounded by a spin count. Callers treat a failed
//! acquisition as a restart, never as a reason to block.

use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED: u64 = 0b01;
const OBSOLETE: u64 = 0b10;
const VERSION_STEP: u64 = 0b100;

/// Spin iterations before a latch acquisition gives up.
pub const DEFAULT_SPIN_LIMIT: u32 = 1 << 12;

/// A version counter with an embedded lock bit.
#[derive(Debug, Default)]
pub struct VersionLatch {
    word: AtomicU64,
}

impl VersionLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Whether a version word carries the obsolete flag.
    #[must_use]
    pub const fn is_obsolete(version: u64) -> bool {
        version & OBSOLETE != 0
    }

    /// Current raw word.
    #[must_use]
    pub fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.load() & LOCKED != 0
    }

    /// Spin until the latch is unlocked and return that version.
    ///
    /// Returns `None` after `spins` attempts.
    #[must_use]
    pub fn stable_version(&self, spins: u32) -> Option<u64> {
        for _ in 0..spins {
            let version = self.load();
            if version & LOCKED == 0 {
                return Some(version);
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Whether the latch still holds exactly `version` (unlocked, unchanged).
    #[must_use]
    pub fn validate(&self, version: u64) -> bool {
        self.load() == version
    }

    /// Lock the latch only if it still holds `version`.
    ///
    /// Used by writers that located a node optimistically: success means the
    /// node has not changed since it was read.
    #[must_use]
    pub fn try_upgrade(&self, version: u64) -> bool {
        version & LOCKED == 0
            && self
                .word
                .compare_exchange(
                    version,
                    version | LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Lock the latch, giving up after `spins` attempts.
    #[must_use]
    pub fn try_lock(&self, spins: u32) -> bool {
        for _ in 0..spins {
            let version = self.load();
            if version & LOCKED == 0 && self.try_upgrade(version) {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Clear the locked bit and advance the version.
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked latch");
        self.word.fetch_add(VERSION_STEP - LOCKED, Ordering::Release);
    }

    /// Unlock and mark the latch obsolete. Readers holding an older version
    /// fail validation; readers arriving later see the obsolete flag.
    pub fn unlock_obsolete(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked latch");
        self.word
            .fetch_add(VERSION_STEP - LOCKED + OBSOLETE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_version_increases_across_lock_cycles() {
        let latch = VersionLatch::new();
        let mut previous = latch.stable_version(1).expect("unlocked");

        for _ in 0..5 {
            assert!(latch.try_lock(1));
            assert!(latch.is_locked());
            latch.unlock();
            let current = latch.stable_version(1).expect("unlocked");
            assert!(current > previous);
            assert!(!VersionLatch::is_obsolete(current));
            previous = current;
        }
    }

    #[test]
    fn test_validate_detects_writer() {
        let latch = VersionLatch::new();
        let version = latch.stable_version(1).expect("unlocked");
        assert!(latch.validate(version));

        assert!(latch.try_lock(1));
        assert!(!latch.validate(version), "locked latch must not validate");
        latch.unlock();
        assert!(!latch.validate(version), "bumped version must not validate");
    }

    #[test]
    fn test_stable_version_gives_up_while_locked() {
        let latch = VersionLatch::new();
        assert!(latch.try_lock(1));
        assert_eq!(latch.stable_version(16), None);
        assert!(!latch.try_lock(16));
        latch.unlock();
        assert!(latch.stable_version(1).is_some());
    }

    #[test]
    fn test_try_upgrade_requires_unchanged_version() {
        let latch = VersionLatch::new();
        let stale = latch.stable_version(1).expect("unlocked");
        assert!(latch.try_lock(1));
        latch.unlock();

        assert!(!latch.try_upgrade(stale));
        let fresh = latch.stable_version(1).expect("unlocked");
        assert!(latch.try_upgrade(fresh));
        assert!(!latch.try_upgrade(fresh), "already locked");
        latch.unlock();
    }

    #[test]
    fn test_unlock_obsolete_sets_flag() {
        let latch = VersionLatch::new();
        assert!(latch.try_lock(1));
        latch.unlock_obsolete();

        let version = latch.stable_version(1).expect("unlocked");
        assert!(VersionLatch::is_obsolete(version));
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_latch_excludes_concurrent_writers() {
        let latch = Arc::new(VersionLatch::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        while !latch.try_lock(DEFAULT_SPIN_LIMIT) {
                            std::thread::yield_now();
                        }
                        // Non-atomic read-modify-write guarded by the latch.
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                        latch.unlock();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("writer thread");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4_000);
    }
}
