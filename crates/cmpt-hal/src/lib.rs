//! Platform abstraction for cmpt
//!
//! The compartment manager never talks to the host directly. Everything it
//! needs from the platform (a console for diagnostics, a monotonic clock for
//! audit timestamps, and entropy for identity seeds) goes through the [`HAL`]
//! trait.
//!
//! # Platform Implementations
//!
//! - **Console** (`cmpt-demo`): stderr, `std::time::Instant`, no entropy (seeds
//!   fall back to the clock)
//! - **Mock** (`cmpt-hal-mock`): captured log, settable clock, deterministic bytes

#![no_std]

/// Platform services used by the manager and the audit log.
pub trait HAL: Send + Sync + 'static {
    // === Time & Entropy ===

    /// Current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    /// Fill `buf` with random bytes
    ///
    /// # Returns
    /// * `Ok(())` - Buffer filled
    /// * `Err(HalError::NotSupported)` - No entropy source on this platform
    fn random_bytes(&self, _buf: &mut [u8]) -> Result<(), HalError> {
        Err(HalError::NotSupported)
    }

    // === Debug ===

    /// Write a diagnostic line to the platform console
    fn debug_write(&self, msg: &str);
}

/// HAL error types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Operation not supported on this platform
    NotSupported,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HalError::NotSupported => write!(f, "operation not supported"),
        }
    }
}

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
impl std::error::Error for HalError {}

/// Derive a 64-bit seed from the platform entropy source.
///
/// Falls back to the monotonic clock when the platform has no entropy.
pub fn seed_from<H: HAL + ?Sized>(hal: &H) -> u64 {
    let mut buf = [0u8; 8];
    match hal.random_bytes(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => hal.now_nanos(),
    }
}
