//! Mock HAL implementation for testing cmpt
//!
//! Captures every debug line, keeps a settable clock and hands out
//! deterministic "random" bytes so manager tests can assert on log output
//! and audit timestamps without a real platform.

#![no_std]
extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use cmpt_hal::{HalError, HAL};
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

/// Mock HAL for unit testing
pub struct MockHal {
    /// Simulated time in nanoseconds
    time: AtomicU64,
    /// Captured debug messages
    debug_log: RefCell<Vec<String>>,
    /// Random seed for deterministic testing
    random_seed: AtomicU64,
}

impl MockHal {
    /// Create a new mock HAL
    pub fn new() -> Self {
        Self::with_time(0)
    }

    /// Create a mock HAL with a specific starting time
    pub fn with_time(nanos: u64) -> Self {
        Self {
            time: AtomicU64::new(nanos),
            debug_log: RefCell::new(Vec::new()),
            random_seed: AtomicU64::new(12345),
        }
    }

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the simulated time to a specific value
    pub fn set_time(&self, nanos: u64) {
        self.time.store(nanos, Ordering::SeqCst);
    }

    /// Get all captured debug messages
    pub fn get_debug_log(&self) -> Vec<String> {
        self.debug_log.borrow().clone()
    }

    /// Clear the debug log
    pub fn clear_debug_log(&self) {
        self.debug_log.borrow_mut().clear();
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log
            .borrow()
            .iter()
            .any(|msg| msg.contains(substr))
    }

    /// Count the messages containing `substr`
    pub fn count_log_containing(&self, substr: &str) -> usize {
        self.debug_log
            .borrow()
            .iter()
            .filter(|msg| msg.contains(substr))
            .count()
    }

    /// Get the number of debug messages
    pub fn debug_log_count(&self) -> usize {
        self.debug_log.borrow().len()
    }

    /// Set the random seed for deterministic testing
    pub fn set_random_seed(&self, seed: u64) {
        self.random_seed.store(seed, Ordering::SeqCst);
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

// MockHal is Send + Sync because it uses atomic operations and RefCell
// is only accessed in single-threaded test contexts
unsafe impl Send for MockHal {}
unsafe impl Sync for MockHal {}

impl HAL for MockHal {
    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buf: &mut [u8]) -> Result<(), HalError> {
        // Simple LCG for deterministic "random" bytes in tests
        let mut seed = self.random_seed.load(Ordering::SeqCst);
        for byte in buf.iter_mut() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            *byte = (seed >> 33) as u8;
        }
        self.random_seed.store(seed, Ordering::SeqCst);
        Ok(())
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(String::from(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_hal_time() {
        let hal = MockHal::new();
        assert_eq!(hal.now_nanos(), 0);

        hal.advance_time(1_000_000_000);
        assert_eq!(hal.now_nanos(), 1_000_000_000);

        hal.set_time(5);
        assert_eq!(hal.now_nanos(), 5);
    }

    #[test]
    fn test_mock_hal_debug_log() {
        let hal = MockHal::new();

        hal.debug_write("[cmpt-manager] init");
        hal.debug_write("[cmpt-manager] created compartment 4");

        assert_eq!(hal.debug_log_count(), 2);
        assert!(hal.has_log_containing("created compartment"));
        assert!(!hal.has_log_containing("destroyed"));
        assert_eq!(hal.count_log_containing("[cmpt-manager]"), 2);

        hal.clear_debug_log();
        assert_eq!(hal.debug_log_count(), 0);
    }

    #[test]
    fn test_mock_hal_random_bytes() {
        let hal = MockHal::new();
        hal.set_random_seed(42);

        let mut buf1 = [0u8; 8];
        let mut buf2 = [0u8; 8];

        hal.random_bytes(&mut buf1).unwrap();
        hal.set_random_seed(42);
        hal.random_bytes(&mut buf2).unwrap();

        assert_eq!(buf1, buf2);
    }
}
