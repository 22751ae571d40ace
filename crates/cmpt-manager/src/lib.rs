//! cmpt Manager - intra-process compartments on a capability machine
//!
//! A compartment wraps one target function with its own stack and identity.
//! Callers hold only a sealed [`CompartmentHandle`]; invoking it branches
//! into a per-compartment copy of the switch trampoline, which swaps the
//! identity register and the stack, scrubs registers, runs the target and
//! switches back.
//!
//! # Module Organization
//!
//! - `manager` - [`CompartmentManager`], the audited entry point
//! - `core` - Manager state: keys, identity counter, compartment table
//! - `trampoline` - The switch trampoline program and descriptor layout
//! - `invoke` - Handle encoding per sealing scheme
//! - `gate` - Call-state tracking and protocol checks
//! - `identity` - Lock-free identity counter
//! - `config` / `error` / `types` - Configuration, errors, public types
//!
//! # Example
//!
//! ```ignore
//! let mut manager = CompartmentManager::new(hal, MachineConfig::default(), ManagerConfig::default())?;
//! manager.init(1)?;
//! let add = manager.register_function(|frame| { /* ... */ Ok(()) })?;
//! let handle = manager.create_compartment(add, 1, &CompartmentFlags::default())?;
//! let result = manager.invoke(&handle, argument)?;
//! ```

#![no_std]
extern crate alloc;

pub mod config;
pub mod core;
pub mod error;
pub mod gate;
pub mod identity;
pub mod invoke;
pub mod manager;
pub mod trampoline;
pub mod types;


pub use config::{CompartmentFlags, ManagerConfig, SealingScheme};
pub use error::CmptError;
pub use manager::CompartmentManager;
pub use types::{CompartmentHandle, CompartmentInfo, Gates, Region};

// Re-export the layers below for callers that only depend on this crate.
pub use cmpt_axiom::{AuditEvent, AuditEventKind, AuditGateway, AuditSnapshot, Mutation, Operation, Outcome};
pub use cmpt_cap::{Capability, ObjectType, Perms};
pub use cmpt_hal::{seed_from, HalError, HAL};
pub use cmpt_machine::{Fault, Machine, MachineConfig, MapError, NativeFrame, Prot};
