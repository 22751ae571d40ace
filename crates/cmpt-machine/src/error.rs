//! Machine error types
//!
//! [`Fault`] is a hardware trap. A machine that raises one halts and never
//! executes again. [`MapError`] is a failed mapping request, returned to the
//! caller with no side effects.

use core::fmt;

use cmpt_cap::Perms;

/// Hardware traps raised by the capability machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Dereference or branch through an untagged capability
    TagViolation { addr: u64 },
    /// Dereference or ordinary branch through a sealed capability
    SealViolation { addr: u64 },
    /// Access outside the capability bounds
    BoundsViolation { addr: u64 },
    /// Capability lacks a required permission
    PermissionViolation { addr: u64, needed: Perms },
    /// Access to an address with no mapping
    Unmapped { addr: u64 },
    /// Page protection forbids the access
    Protection { addr: u64 },
    /// Instruction fetched from a page written since the last cache flush
    StaleInstruction { addr: u64 },
    /// Capability access not aligned to the 16-byte granule
    Alignment { addr: u64 },
    /// Undefined or unencodable instruction
    Undefined { addr: u64, word: u32 },
    /// Branch-sealed-pair operands do not form a valid pair
    SealedPairMismatch { addr: u64 },
    /// System register access without SYS_REG in PCC
    SystemRegister { addr: u64 },
    /// Identity counter left the object-type range
    ObjectTypeOverflow { value: u64 },
    /// Invocation of a handle whose compartment was destroyed
    StaleHandle { addr: u64 },
    /// A checked call-protocol transition did not hold
    ProtocolViolation { detail: &'static str },
    /// Execution did not return within the step budget
    Runaway { steps: u64 },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::TagViolation { addr } => write!(f, "tag violation at {:#x}", addr),
            Fault::SealViolation { addr } => write!(f, "seal violation at {:#x}", addr),
            Fault::BoundsViolation { addr } => write!(f, "bounds violation at {:#x}", addr),
            Fault::PermissionViolation { addr, needed } => {
                write!(f, "permission violation at {:#x}: needs {:?}", addr, needed)
            }
            Fault::Unmapped { addr } => write!(f, "unmapped address {:#x}", addr),
            Fault::Protection { addr } => write!(f, "page protection fault at {:#x}", addr),
            Fault::StaleInstruction { addr } => {
                write!(f, "instruction fetch from unflushed page at {:#x}", addr)
            }
            Fault::Alignment { addr } => write!(f, "misaligned capability access at {:#x}", addr),
            Fault::Undefined { addr, word } => {
                write!(f, "undefined instruction {:#010x} at {:#x}", word, addr)
            }
            Fault::SealedPairMismatch { addr } => {
                write!(f, "invalid sealed pair at {:#x}", addr)
            }
            Fault::SystemRegister { addr } => {
                write!(f, "privileged system register access at {:#x}", addr)
            }
            Fault::ObjectTypeOverflow { value } => {
                write!(f, "identity {:#x} exceeds the object type range", value)
            }
            Fault::StaleHandle { addr } => write!(f, "stale compartment handle {:#x}", addr),
            Fault::ProtocolViolation { detail } => write!(f, "call protocol violation: {}", detail),
            Fault::Runaway { steps } => write!(f, "no return after {} steps", steps),
        }
    }
}

/// Mapping failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Memory limit reached
    OutOfMemory,
    /// Requested protection is both writable and executable
    WriteExecute,
    /// Requested protection exceeds the mapping's maximum protection
    ExceedsMaxProt,
    /// No mapping covers the range
    NotMapped,
    /// Zero, unaligned or partial-region length
    InvalidLength,
    /// Authority capability is untagged, sealed, lacks VMEM or does not cover
    /// the range; or the process root authority was already taken
    InvalidAuthority,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "out of memory"),
            MapError::WriteExecute => write!(f, "writable and executable mapping refused"),
            MapError::ExceedsMaxProt => write!(f, "protection exceeds maximum protection"),
            MapError::NotMapped => write!(f, "range not mapped"),
            MapError::InvalidLength => write!(f, "invalid length"),
            MapError::InvalidAuthority => write!(f, "no authority for the mapping"),
        }
    }
}

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
impl std::error::Error for Fault {}

#[cfg(feature = "std")]
impl std::error::Error for MapError {}
