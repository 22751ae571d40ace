//! Manager error types

use core::fmt;

use cmpt_machine::{AsmError, Fault, MapError};

/// Errors returned by [`CompartmentManager`](crate::CompartmentManager)
/// operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmptError {
    /// `init` has not run, or the platform did not expose a root
    NotInitialized,
    /// Zero stack pages, or more than the machine can ever map
    InvalidStackPages { requested: u64 },
    /// The target is untagged, or stripping its permissions invalidated it
    InvalidTarget,
    /// A mapping for a new compartment could not be made
    ResourceExhausted(MapError),
    /// Unmapping a compartment's regions failed
    Unmap(MapError),
    /// The handle names no live compartment
    UnknownCompartment { handle: u64 },
    /// The trampoline program failed to assemble
    Trampoline(AsmError),
    /// The machine halted
    Fault(Fault),
}

impl CmptError {
    /// True for integrity faults. After one, the manager accepts no further
    /// work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CmptError::Fault(_))
    }
}

impl fmt::Display for CmptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmptError::NotInitialized => write!(f, "compartment manager not initialized"),
            CmptError::InvalidStackPages { requested } => {
                write!(f, "invalid stack size: {} pages", requested)
            }
            CmptError::InvalidTarget => write!(f, "invalid target capability"),
            CmptError::ResourceExhausted(e) => write!(f, "resource exhausted: {}", e),
            CmptError::Unmap(e) => write!(f, "unmap failed: {}", e),
            CmptError::UnknownCompartment { handle } => {
                write!(f, "no compartment with handle {:#x}", handle)
            }
            CmptError::Trampoline(e) => write!(f, "trampoline assembly failed: {}", e),
            CmptError::Fault(fault) => write!(f, "fatal: {}", fault),
        }
    }
}

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
impl std::error::Error for CmptError {}

impl From<Fault> for CmptError {
    fn from(fault: Fault) -> Self {
        CmptError::Fault(fault)
    }
}
