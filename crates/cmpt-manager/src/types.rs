//! Compartment types

use cmpt_cap::Capability;
use serde::Serialize;

/// Opaque reference to a compartment. The only thing it is good for is
/// [`invoke`](crate::CompartmentManager::invoke).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompartmentHandle(pub(crate) Capability);

impl CompartmentHandle {
    /// The sealed capability behind the handle. A sealed copy confers no
    /// authority on its own.
    pub fn capability(&self) -> Capability {
        self.0
    }

    /// Address the handle points at, which identifies the compartment.
    pub fn address(&self) -> u64 {
        self.0.address()
    }
}

/// A mapped range owned by a compartment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Region {
    pub base: u64,
    pub len: u64,
}

impl Region {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.len
    }

    pub(crate) fn of(cap: &Capability) -> Self {
        Self {
            base: cap.base(),
            len: cap.length(),
        }
    }
}

/// Live compartment bookkeeping. The mapping capabilities are the authority
/// used to unmap the regions on teardown.
pub(crate) struct Compartment {
    pub id: u64,
    pub otype: u16,
    pub handle: Capability,
    pub identity: Capability,
    pub code_map: Capability,
    pub data_map: Capability,
    pub stack_map: Capability,
    pub stack_pages: u64,
}

impl Compartment {
    pub fn info(&self) -> CompartmentInfo {
        CompartmentInfo {
            id: self.id,
            otype: self.otype,
            handle: self.handle.address(),
            code: Region::of(&self.code_map),
            data: Region::of(&self.data_map),
            stack: Region::of(&self.stack_map),
            stack_pages: self.stack_pages,
        }
    }
}

/// Diagnostic view of a compartment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompartmentInfo {
    /// Identity value
    pub id: u64,
    /// Object type its gates are sealed with
    pub otype: u16,
    /// Handle address
    pub handle: u64,
    /// Trampoline, descriptor and handle block
    pub code: Region,
    /// Runtime record
    pub data: Region,
    pub stack: Region,
    pub stack_pages: u64,
}

/// Copies of a compartment's descriptor slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gates {
    pub identity: Capability,
    pub target: Capability,
    pub entry: Capability,
    pub data: Capability,
    pub exit: Capability,
}
