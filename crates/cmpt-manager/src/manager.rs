//! CompartmentManager - the audit gateway in front of the manager core
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 COMPARTMENT MANAGER                   │
//! │                                                      │
//! │   ┌──────────────────────────────────────────────┐   │
//! │   │                 AUDIT GATEWAY                 │   │
//! │   │   - AuditLog (request / response)            │   │
//! │   │   - Ledger (mutations)                       │   │
//! │   └──────────────────────────────────────────────┘   │
//! │                         │                            │
//! │                         ▼                            │
//! │   ┌──────────────────────────────────────────────┐   │
//! │   │                 MANAGER CORE                  │   │
//! │   │   - Sealing key, identity counter            │   │
//! │   │   - Compartment table                        │   │
//! │   │   - Machine (memory, registers, trampolines) │   │
//! │   └──────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation flows: `caller → AuditGateway (log) → ManagerCore
//! (execute) → AuditGateway (record) → caller`.

use alloc::string::ToString;
use alloc::vec::Vec;

use cmpt_axiom::{AuditGateway, Mutation, Operation};
use cmpt_cap::{Capability, Perms};
use cmpt_hal::HAL;
use cmpt_machine::{Fault, Machine, MachineConfig, NativeFrame};

use crate::config::{CompartmentFlags, ManagerConfig};
use crate::core::ManagerCore;
use crate::error::CmptError;
use crate::types::{CompartmentHandle, CompartmentInfo, Gates};

/// The compartment manager.
pub struct CompartmentManager<H: HAL> {
    /// Audit trail of every operation
    pub audit: AuditGateway,
    core: ManagerCore<H>,
    boot_time: u64,
}

impl<H: HAL> CompartmentManager<H> {
    /// Reset a machine with `machine_config` and put a manager on it.
    pub fn new(hal: H, machine_config: MachineConfig, config: ManagerConfig) -> Result<Self, CmptError> {
        let machine = Machine::new(machine_config).map_err(CmptError::ResourceExhausted)?;
        Self::with_machine(hal, machine, config)
    }

    /// Put a manager on an existing machine.
    pub fn with_machine(hal: H, machine: Machine, config: ManagerConfig) -> Result<Self, CmptError> {
        let boot_time = hal.now_nanos();
        Ok(Self {
            audit: AuditGateway::new(),
            core: ManagerCore::new(hal, machine, config)?,
            boot_time,
        })
    }

    pub fn hal(&self) -> &H {
        self.core.hal()
    }

    pub fn uptime_nanos(&self) -> u64 {
        self.core.hal().now_nanos().saturating_sub(self.boot_time)
    }

    pub fn config(&self) -> &ManagerConfig {
        self.core.config()
    }

    pub fn machine(&self) -> &Machine {
        self.core.machine()
    }

    /// Host access to the machine, for placing code and inspecting state.
    pub fn machine_mut(&mut self) -> &mut Machine {
        self.core.machine_mut()
    }

    pub fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    /// Register a host function as a compartment target. Returns a sentry.
    pub fn register_function<F>(&mut self, f: F) -> Result<Capability, CmptError>
    where
        F: Fn(&mut NativeFrame<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.core
            .machine_mut()
            .register_native(f)
            .map_err(CmptError::ResourceExhausted)
    }

    /// Run one core operation through the audit gateway. A halt that happens
    /// during the operation is recorded in the ledger.
    fn audited<T>(
        &mut self,
        operation: Operation,
        op_fn: impl FnOnce(&mut ManagerCore<H>) -> (Result<T, CmptError>, Vec<Mutation>),
    ) -> Result<T, CmptError> {
        let timestamp = self.uptime_nanos();
        let core = &mut self.core;
        self.audit.operation(operation, timestamp, || {
            let was_halted = core.machine().halted().is_some();
            let (result, mut mutations) = op_fn(core);
            if let (false, Some(fault)) = (was_halted, core.machine().halted()) {
                mutations.push(Mutation::Halted {
                    fault: fault.to_string(),
                });
            }
            (result, mutations)
        })
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Derive the sealing key and start identities at `seed`.
    ///
    /// Not safe to repeat: a second call restarts the identity counter.
    pub fn init(&mut self, seed: u64) -> Result<(), CmptError> {
        self.audited(Operation::Init { seed }, |core| core.init(seed))
    }

    /// Wrap `target` in a new compartment with its own stack and identity.
    pub fn create_compartment(
        &mut self,
        target: Capability,
        stack_pages: u64,
        flags: &CompartmentFlags,
    ) -> Result<CompartmentHandle, CmptError> {
        let operation = Operation::CreateCompartment {
            target: target.address(),
            stack_pages,
            privileged: flags.allow_privileged_register_access,
        };
        self.audited(operation, |core| core.create_compartment(target, stack_pages, flags))
    }

    /// Call into a compartment with one argument.
    pub fn invoke(&mut self, handle: &CompartmentHandle, arg: Capability) -> Result<Capability, CmptError> {
        let operation = Operation::Invoke {
            handle: handle.address(),
        };
        self.audited(operation, |core| core.invoke(handle, arg))
    }

    /// Call into a compartment with an integer argument and integer result.
    pub fn invoke_value(&mut self, handle: &CompartmentHandle, value: u64) -> Result<u64, CmptError> {
        self.invoke(handle, Capability::from_int(value))
            .map(|result| result.address())
    }

    /// Tear a compartment down. Its handle becomes stale.
    pub fn destroy_compartment(&mut self, handle: &CompartmentHandle) -> Result<(), CmptError> {
        let operation = Operation::DestroyCompartment {
            handle: handle.address(),
        };
        self.audited(operation, |core| core.destroy_compartment(handle))
    }

    /// Clear `mask` from `cap` and reseal it as a sentry, rebuilding sealed
    /// capabilities from the process code root.
    pub fn strip_permission_and_reseal(&mut self, cap: Capability, mask: Perms) -> Result<Capability, CmptError> {
        let operation = Operation::StripAndReseal {
            address: cap.address(),
            mask: mask.bits(),
        };
        self.audited(operation, |core| core.strip_permission_and_reseal(cap, mask))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn compartments(&self) -> Vec<CompartmentInfo> {
        self.core.compartments()
    }

    /// Copies of a compartment's sealed descriptor slots.
    pub fn gates(&mut self, handle: &CompartmentHandle) -> Result<Gates, CmptError> {
        self.core.gates(handle)
    }

    pub fn identity_of(&self, handle: &CompartmentHandle) -> Option<u64> {
        self.core.identity_of(handle)
    }

    /// Identity the next compartment will get.
    pub fn next_identity(&self) -> u64 {
        self.core.next_identity()
    }
}
