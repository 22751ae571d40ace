//! Compartment identity counter
//!
//! Every compartment gets the next value of a process-wide counter as its
//! identity, and that value doubles as the object type its gates are sealed
//! with. Values below the first user object type are skipped, and the counter
//! refuses to move past the largest object type, so two compartments never
//! share a type.

#[cfg(all(test, feature = "loom"))]
use loom::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(all(test, feature = "loom")))]
use core::sync::atomic::{AtomicU64, Ordering};

use cmpt_cap::{ObjectType, OTYPE_MASK};

/// Lock-free identity source.
pub struct IdentityCounter {
    next: AtomicU64,
}

impl IdentityCounter {
    /// Start counting at `seed`, or at the first user object type if `seed`
    /// is below it.
    pub fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed.max(ObjectType::FIRST_USER)),
        }
    }

    /// Restart at `seed`. Identities already minted may be minted again.
    pub fn reset(&self, seed: u64) {
        self.next
            .store(seed.max(ObjectType::FIRST_USER), Ordering::SeqCst);
    }

    /// Take the next identity.
    ///
    /// Returns `Err(value)` once the counter has passed the object-type range;
    /// the counter then stays where it is.
    pub fn mint(&self) -> Result<u64, u64> {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            if current > OTYPE_MASK {
                return Err(current);
            }
            if self
                .next
                .compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    /// The identity the next `mint` would return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
