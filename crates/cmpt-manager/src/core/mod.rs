//! Manager core - compartment state and the operations on it
//!
//! `ManagerCore` owns the HAL, the machine, the sealing key, the identity
//! counter and the compartment table. Every operation returns its result
//! together with the [`Mutation`]s it performed; the caller records them.
//! Nothing here touches the audit trail directly.

mod call;
mod lifecycle;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use cmpt_axiom::Mutation;
use cmpt_cap::{Capability, Perms, OTYPE_MASK};
use cmpt_hal::HAL;
use cmpt_machine::{AsmError, AuxType, Fault, Machine, Program};

use crate::config::ManagerConfig;
use crate::error::CmptError;
use crate::identity::IdentityCounter;
use crate::trampoline::{self, Layout, DESC_DATA, DESC_ENTRY, DESC_EXIT, DESC_IDENTITY, DESC_TARGET};
use crate::types::{Compartment, CompartmentHandle, CompartmentInfo, Gates};

pub use lifecycle::strip_and_reseal;

/// Compartment manager state.
pub struct ManagerCore<H: HAL> {
    hal: H,
    machine: Machine,
    config: ManagerConfig,
    trampoline: Program,
    layout: Layout,
    /// SEAL-only key over every user object type
    sealer: Option<Capability>,
    /// CMPT_ID root identities are stamped from
    identity_root: Option<Capability>,
    identities: IdentityCounter,
    /// Live compartments by handle address
    compartments: BTreeMap<u64, Compartment>,
}

impl<H: HAL> ManagerCore<H> {
    /// Assemble the trampoline and take ownership of `machine`. The manager
    /// starts uninitialized.
    pub fn new(hal: H, machine: Machine, config: ManagerConfig) -> Result<Self, CmptError> {
        let trampoline = trampoline::assemble().map_err(CmptError::Trampoline)?;
        let layout = Layout::of(&trampoline).ok_or(CmptError::Trampoline(AsmError::UndefinedLabel(
            trampoline::TRAMPOLINE_END,
        )))?;
        Ok(Self {
            hal,
            machine,
            config,
            trampoline,
            layout,
            sealer: None,
            identity_root: None,
            identities: IdentityCounter::new(0),
            compartments: BTreeMap::new(),
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_initialized(&self) -> bool {
        self.sealer.is_some() && self.identity_root.is_some()
    }

    /// Identity the next compartment will get.
    pub fn next_identity(&self) -> u64 {
        self.identities.peek()
    }

    fn log(&self, msg: &str) {
        self.hal.debug_write(&format!("[cmpt-manager] {}", msg));
    }

    fn running(&self) -> Result<(), CmptError> {
        match self.machine.halted() {
            Some(fault) => Err(CmptError::Fault(fault)),
            None => Ok(()),
        }
    }

    /// Halt the machine. Returns the error to report, which carries the first
    /// fault if the machine was already halted.
    fn fatal(&mut self, fault: Fault) -> CmptError {
        let first = self.machine.halt(fault);
        self.log(&format!("FATAL: {}", first));
        CmptError::Fault(first)
    }

    fn pcc_root(&self) -> Capability {
        self.machine
            .getauxptr(AuxType::PccCap)
            .unwrap_or(Capability::NULL)
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Derive the sealing key and restart the identity counter at `seed`.
    ///
    /// A missing platform root leaves the manager uninitialized. Running this
    /// twice restarts the counter, so identities can repeat. A seed past the
    /// last object type is accepted with a warning; creating a compartment
    /// under it is an integrity fault.
    pub fn init(&mut self, seed: u64) -> (Result<(), CmptError>, Vec<Mutation>) {
        if let Err(e) = self.running() {
            return (Err(e), Vec::new());
        }
        if self.is_initialized() {
            self.log(&format!(
                "init: re-deriving identity counter at {} (was {}); identities may repeat",
                seed,
                self.identities.peek()
            ));
        }

        self.sealer = self
            .machine
            .getauxptr(AuxType::SealCap)
            .map(|root| root.perms_and(Perms::SEAL))
            .filter(Capability::is_valid);
        self.identity_root = self
            .machine
            .getauxptr(AuxType::CidCap)
            .map(|root| root.with_address(seed))
            .filter(Capability::is_valid);
        self.identities.reset(seed);

        if self.sealer.is_none() {
            self.log("init: platform exposes no seal root; manager stays uninitialized");
        }
        if self.identity_root.is_none() {
            self.log("init: platform exposes no identity root; manager stays uninitialized");
        }
        if self.is_initialized() {
            self.log(&format!("init: ready, first identity {}", self.identities.peek()));
            if seed > OTYPE_MASK {
                self.log(&format!(
                    "init: WARNING seed {:#x} is past the last object type {:#x}; creation will fault",
                    seed, OTYPE_MASK
                ));
            }
        }

        let mutation = Mutation::Initialized {
            seed,
            sealer_valid: self.sealer.is_some(),
            identity_valid: self.identity_root.is_some(),
        };
        (Ok(()), vec![mutation])
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    fn lookup(&self, handle: &CompartmentHandle) -> Option<&Compartment> {
        self.compartments
            .get(&handle.address())
            .filter(|c| c.handle == handle.0)
    }

    /// Every live compartment, in handle order.
    pub fn compartments(&self) -> Vec<CompartmentInfo> {
        self.compartments.values().map(Compartment::info).collect()
    }

    pub fn identity_of(&self, handle: &CompartmentHandle) -> Option<u64> {
        self.lookup(handle).map(|c| c.id)
    }

    /// Read back the descriptor of a live compartment.
    pub fn gates(&mut self, handle: &CompartmentHandle) -> Result<Gates, CmptError> {
        self.running()?;
        let code = self
            .lookup(handle)
            .map(|c| c.code_map)
            .ok_or(CmptError::UnknownCompartment {
                handle: handle.address(),
            })?;
        let desc = code.base() + self.layout.descriptor;
        let mut slot = |offset: u64| self.machine.load_cap(&code, desc + offset);
        Ok(Gates {
            identity: slot(DESC_IDENTITY)?,
            target: slot(DESC_TARGET)?,
            entry: slot(DESC_ENTRY)?,
            data: slot(DESC_DATA)?,
            exit: slot(DESC_EXIT)?,
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use cmpt_hal_mock::MockHal;
    use cmpt_machine::MachineConfig;

    fn core_with(config: MachineConfig) -> ManagerCore<MockHal> {
        let machine = Machine::new(config).unwrap();
        ManagerCore::new(MockHal::new(), machine, ManagerConfig::default()).unwrap()
    }

    #[test]
    fn test_init_derives_seal_only_key() {
        let mut core = core_with(MachineConfig::default());
        assert!(!core.is_initialized());

        let (result, mutations) = core.init(42);
        assert_eq!(result, Ok(()));
        assert!(core.is_initialized());
        assert_eq!(core.sealer.unwrap().perms(), Perms::SEAL);
        assert_eq!(core.identity_root.unwrap().address(), 42);
        assert_eq!(core.next_identity(), 42);
        assert!(matches!(
            mutations[0],
            Mutation::Initialized {
                seed: 42,
                sealer_valid: true,
                identity_valid: true
            }
        ));
    }

    #[test]
    fn test_missing_identity_root_leaves_uninitialized() {
        let mut core = core_with(MachineConfig {
            expose_cid_root: false,
            ..MachineConfig::default()
        });
        let (result, _) = core.init(5);
        assert_eq!(result, Ok(()));
        assert!(!core.is_initialized());
        assert!(core.hal().has_log_containing("no identity root"));
    }

    #[test]
    fn test_reinit_is_logged() {
        let mut core = core_with(MachineConfig::default());
        let _ = core.init(5);
        let _ = core.init(5);
        assert!(core.hal().has_log_containing("identities may repeat"));
    }

    #[test]
    fn test_out_of_range_seed_warns_once() {
        let mut core = core_with(MachineConfig::default());
        let _ = core.init(OTYPE_MASK);
        assert_eq!(core.hal().count_log_containing("WARNING"), 0);

        let (result, _) = core.init(OTYPE_MASK + 1);
        assert_eq!(result, Ok(()));
        assert!(core.is_initialized());
        assert_eq!(core.hal().count_log_containing("past the last object type"), 1);
    }
}
