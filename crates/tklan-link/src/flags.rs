//! Deadline-bearing request flags.
//!
//! Master hand-over requests (`want_master`, `give_master`) must not outlive
//! their moment: a request set twenty seconds ago by an operator who gave up
//! must read as clear. Every flag therefore carries an absolute expiry stamp
//! and consumers observe expired flags as unset.

use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// A boolean flag with an attached value and an expiry deadline.
///
/// `set` arms the flag for the configured timeout; `get`/`take` return
/// `None` once the deadline passes, lazily clearing the slot.
#[derive(Debug)]
pub struct DeadlineFlag<T> {
    timeout: Duration,
    slot: Mutex<Option<(T, Instant)>>,
}

impl<T: Copy> DeadlineFlag<T> {
    /// Create a cleared flag whose future arms expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, slot: Mutex::new(None) }
    }

    /// Arm the flag with `value` until the timeout elapses.
    pub fn set(&self, value: T) {
        let deadline = Instant::now() + self.timeout;
        *self.lock() = Some((value, deadline));
    }

    /// Disarm the flag.
    pub fn clear(&self) {
        *self.lock() = None;
    }

    /// Current value, `None` if unset or expired.
    pub fn get(&self) -> Option<T> {
        let mut slot = self.lock();
        match *slot {
            Some((value, deadline)) if deadline > Instant::now() => Some(value),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    /// Take the value, clearing the flag. `None` if unset or expired.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.lock();
        match slot.take() {
            Some((value, deadline)) if deadline > Instant::now() => Some(value),
            _ => None,
        }
    }

    /// Whether the flag is armed and not yet expired.
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(T, Instant)>> {
        // A poisoned flag is still just a flag; recover the inner state.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
