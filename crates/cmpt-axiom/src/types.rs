//! Audit record types

use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Monotonic identifier of an audit event or ledger entry.
pub type EventId = u64;

/// A manager operation, as recorded in the audit log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Derive the sealing key and identity counter
    Init { seed: u64 },
    /// Build a compartment around a target function
    CreateCompartment {
        target: u64,
        stack_pages: u64,
        privileged: bool,
    },
    /// Call into a compartment through its handle
    Invoke { handle: u64 },
    /// Tear a compartment down
    DestroyCompartment { handle: u64 },
    /// Strip permissions from a capability and reseal it as a sentry
    StripAndReseal { address: u64, mask: u32 },
}

impl Operation {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Init { .. } => "init",
            Operation::CreateCompartment { .. } => "create",
            Operation::Invoke { .. } => "invoke",
            Operation::DestroyCompartment { .. } => "destroy",
            Operation::StripAndReseal { .. } => "reseal",
        }
    }
}

/// How an operation ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    Err { error: String },
}

/// A state change caused by an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Manager keys were (re)derived
    Initialized {
        seed: u64,
        sealer_valid: bool,
        identity_valid: bool,
    },
    /// A compartment now exists
    CompartmentCreated {
        id: u64,
        otype: u16,
        handle: u64,
        code: u64,
        data: u64,
        stack: u64,
        stack_pages: u64,
    },
    /// A compartment's regions were unmapped
    CompartmentDestroyed { id: u64, handle: u64 },
    /// The machine halted on an integrity fault
    Halted { fault: String },
}
