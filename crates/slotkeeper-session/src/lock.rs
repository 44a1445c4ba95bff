//! The reconnection lock.
//!
//! Resuming a session is "check the session is awaiting its owner, then
//! rebind it". Two tabs from the same browser can both pass the check; only
//! one may rebind. The lock makes the pair atomic across any `.await` the
//! resumption performs.
//!
//! # Pairing
//!
//! [`ReconnectLock::try_acquire`] is the only way in, and it hands back a
//! [`ReconnectGuard`]. Release happens when the guard drops, on every path
//! including early returns and panics. There is no manual unlock.

use std::sync::atomic::{AtomicBool, Ordering};

/// A non-blocking test-and-set lock.
#[derive(Debug, Default)]
pub struct ReconnectLock {
    held: AtomicBool,
}

impl ReconnectLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock if it is free. Never waits.
    ///
    /// `None` means another resumption is in flight; the caller should tell
    /// its client so rather than retry.
    pub fn try_acquire(&self) -> Option<ReconnectGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconnectGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Proof of holding the [`ReconnectLock`]. Releases it on drop.
#[derive(Debug)]
pub struct ReconnectGuard<'a> {
    lock: &'a ReconnectLock,
}

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
