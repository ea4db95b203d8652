//! Test-and-set spin flag.
//!
//! Both cores serialize very short pointer edits (a trie node's child list,
//! a listener list head) with a raw test-and-set flag rather than a full
//! mutex. The flag guards a critical section measured in a handful of
//! atomic stores, so spinning is cheaper than parking.

use std::sync::atomic::{AtomicBool, Ordering};

/// A raw test-and-set lock. The protected data is not wrapped — both cores
/// guard structures whose fields are themselves atomics — so the flag only
/// provides mutual exclusion, not a typed container.
#[derive(Debug, Default)]
pub struct SpinFlag {
    locked: AtomicBool,
}

impl SpinFlag {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the flag is acquired. The guard releases on drop.
    pub fn lock(&self) -> SpinGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        SpinGuard { flag: self }
    }
}

/// RAII guard for [`SpinFlag`].
pub struct SpinGuard<'a> {
    flag: &'a SpinFlag,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.flag.locked.store(false, Ordering::Release);
    }
}
