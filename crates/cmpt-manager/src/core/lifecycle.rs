//! Compartment construction and teardown

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use cmpt_axiom::Mutation;
use cmpt_cap::{Capability, ObjectType, Perms, CAP_SIZE, OTYPE_MASK};
use cmpt_hal::HAL;
use cmpt_machine::{MapError, Prot};

use super::ManagerCore;
use crate::config::CompartmentFlags;
use crate::error::CmptError;
use crate::invoke;
use crate::trampoline::{
    DESC_DATA, DESC_ENTRY, DESC_EXIT, DESC_IDENTITY, DESC_TARGET, RECORD_CALLER_CID, RECORD_SIZE,
    RECORD_STACK,
};
use crate::types::{Compartment, CompartmentHandle};

/// Clear `mask` from `cap` and return it as a sentry.
///
/// A sealed `cap` cannot be modified in place, so it is rebuilt from `pcc`,
/// keeping its object type. The result is untagged when `pcc` does not cover
/// it.
pub fn strip_and_reseal(pcc: &Capability, cap: &Capability, mask: Perms) -> Capability {
    let stripped = if cap.is_sealed() {
        Capability::build(pcc, &cap.perms_clear(mask))
    } else {
        cap.perms_clear(mask)
    };
    if stripped.is_sealed() {
        stripped
    } else {
        stripped.sentry()
    }
}

/// Regions mapped for one compartment.
struct Maps {
    code: Capability,
    data: Capability,
    stack: Capability,
}

impl<H: HAL> ManagerCore<H> {
    /// Public form of [`strip_and_reseal`] using the process code root.
    pub fn strip_permission_and_reseal(
        &mut self,
        cap: Capability,
        mask: Perms,
    ) -> (Result<Capability, CmptError>, Vec<Mutation>) {
        if let Err(e) = self.running() {
            return (Err(e), Vec::new());
        }
        let out = strip_and_reseal(&self.pcc_root(), &cap, mask);
        if out.is_valid() {
            (Ok(out), Vec::new())
        } else {
            (Err(CmptError::InvalidTarget), Vec::new())
        }
    }

    /// Seal `cap` with the object type named by `identity`.
    ///
    /// Only capabilities carrying CAP_INVOKE are sealed, and only under a
    /// tagged CMPT_ID identity; anything else comes back untagged.
    fn seal_gate(
        &mut self,
        sealer: &Capability,
        cap: &Capability,
        identity: &Capability,
    ) -> Result<Capability, CmptError> {
        if !cap.check_perms(Perms::CAP_INVOKE)
            || !identity.is_valid()
            || !identity.check_perms(Perms::CMPT_ID)
        {
            return Ok(cap.tag_cleared());
        }
        let otype = identity.address().max(ObjectType::FIRST_USER);
        if otype > OTYPE_MASK {
            return Err(self.fatal(cmpt_machine::Fault::ObjectTypeOverflow { value: otype }));
        }
        Ok(cap.seal(&sealer.with_address(otype)))
    }

    fn prepare_target(&self, target: Capability, flags: &CompartmentFlags) -> Result<Capability, CmptError> {
        if !target.is_valid() {
            return Err(CmptError::InvalidTarget);
        }
        let mut target = target;
        if !flags.allow_privileged_register_access {
            target = strip_and_reseal(&self.pcc_root(), &target, Perms::SYS_REG);
        }
        if !target.is_sealed() {
            target = target.sentry();
        }
        if !target.is_valid() {
            return Err(CmptError::InvalidTarget);
        }
        Ok(target)
    }

    /// Unmap every region in `maps`, logging failures.
    fn release(&mut self, maps: &[Capability]) {
        for map in maps {
            if let Err(e) = self.machine.munmap(map, map.base(), map.length()) {
                self.log(&format!("release: unmap {:#x} failed: {}", map.base(), e));
            }
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Build a compartment around `target` with a stack of `stack_pages`
    /// pages.
    pub fn create_compartment(
        &mut self,
        target: Capability,
        stack_pages: u64,
        flags: &CompartmentFlags,
    ) -> (Result<CompartmentHandle, CmptError>, Vec<Mutation>) {
        match self.try_create(target, stack_pages, flags) {
            Ok(cmpt) => {
                let handle = CompartmentHandle(cmpt.handle);
                let mutation = Mutation::CompartmentCreated {
                    id: cmpt.id,
                    otype: cmpt.otype,
                    handle: cmpt.handle.address(),
                    code: cmpt.code_map.base(),
                    data: cmpt.data_map.base(),
                    stack: cmpt.stack_map.base(),
                    stack_pages: cmpt.stack_pages,
                };
                self.compartments.insert(cmpt.handle.address(), cmpt);
                (Ok(handle), vec![mutation])
            }
            Err(e) => {
                self.log(&format!("create: {}", e));
                (Err(e), Vec::new())
            }
        }
    }

    fn try_create(
        &mut self,
        target: Capability,
        stack_pages: u64,
        flags: &CompartmentFlags,
    ) -> Result<Compartment, CmptError> {
        self.running()?;
        let (sealer, identity_root) = match (self.sealer, self.identity_root) {
            (Some(s), Some(i)) => (s, i),
            _ => return Err(CmptError::NotInitialized),
        };
        let page_size = self.machine.memory().page_size();
        if stack_pages == 0 || stack_pages > self.machine.memory().limit_pages() {
            return Err(CmptError::InvalidStackPages {
                requested: stack_pages,
            });
        }
        let target = self.prepare_target(target, flags)?;
        if self.layout.object_size > page_size {
            return Err(CmptError::ResourceExhausted(MapError::InvalidLength));
        }

        let code = self
            .machine
            .mmap(page_size, Prot::RW | Prot::CAP_INVOKE, Prot::RWX)
            .map_err(CmptError::ResourceExhausted)?;
        let data = match self.machine.mmap(page_size, Prot::RW | Prot::CAP_INVOKE, Prot::empty()) {
            Ok(data) => data,
            Err(e) => {
                self.release(&[code]);
                return Err(CmptError::ResourceExhausted(e));
            }
        };
        let stack = match self
            .machine
            .mmap(stack_pages * page_size, Prot::RW, Prot::empty())
        {
            Ok(stack) => stack,
            Err(e) => {
                self.release(&[code, data]);
                return Err(CmptError::ResourceExhausted(e));
            }
        };

        let maps = Maps { code, data, stack };
        match self.populate(&maps, target, stack_pages, flags, &sealer, &identity_root) {
            Ok(cmpt) => Ok(cmpt),
            Err(e) => {
                self.release(&[maps.code, maps.data, maps.stack]);
                Err(e)
            }
        }
    }

    /// Fill freshly mapped regions: trampoline, runtime record, descriptor,
    /// handle block. Flips the code page to RX when done.
    fn populate(
        &mut self,
        maps: &Maps,
        target: Capability,
        stack_pages: u64,
        flags: &CompartmentFlags,
        sealer: &Capability,
        identity_root: &Capability,
    ) -> Result<Compartment, CmptError> {
        let layout = self.layout;
        let base = maps.code.base();
        let page_size = self.machine.memory().page_size();

        let id = match self.identities.mint() {
            Ok(id) => id,
            Err(value) => return Err(self.fatal(cmpt_machine::Fault::ObjectTypeOverflow { value })),
        };
        let identity = identity_root.with_address(id).sentry();

        // Relocate the trampoline.
        let image = self.trampoline.to_bytes();
        self.machine.store_bytes(&maps.code, base, &image)?;

        // Runtime record: callee stack, empty caller-CID slot.
        let record = maps
            .data
            .bounds_set_exact(RECORD_SIZE)
            .perms_and(Perms::RWI);
        let mut stack = maps
            .stack
            .perms_and(Perms::RW)
            .with_address(maps.stack.limit());
        if !flags.allow_stack_store_local_capability {
            stack = stack.perms_clear(Perms::STORE_LOCAL_CAP);
        }
        if !flags.allow_stack_mutable_load {
            stack = stack.perms_clear(Perms::MUTABLE_LOAD);
        }
        self.machine
            .store_cap(&record, record.base() + RECORD_STACK, stack)?;
        self.machine
            .store_cap(&record, record.base() + RECORD_CALLER_CID, Capability::NULL)?;

        // Descriptor.
        let entry_code = maps
            .code
            .with_address(base + layout.cmpt_start)
            .perms_and(Perms::RXI);
        let exit_code = maps
            .code
            .with_address(base + layout.cmpt_end)
            .perms_and(Perms::RXI);
        let entry = self.seal_gate(sealer, &entry_code, &identity)?;
        let data = self.seal_gate(sealer, &record, &identity)?;
        let exit = self.seal_gate(sealer, &exit_code, &identity)?;
        let desc = base + layout.descriptor;
        for (offset, value) in [
            (DESC_IDENTITY, identity),
            (DESC_TARGET, target),
            (DESC_ENTRY, entry),
            (DESC_DATA, data),
            (DESC_EXIT, exit),
        ] {
            self.machine.store_cap(&maps.code, desc + offset, value)?;
        }

        // Handle block and handle.
        let object = maps
            .code
            .with_address(base)
            .bounds_set_exact(layout.object_size);
        let (block, handle) = invoke::build_handle(self.config.scheme, &object, &layout);
        for (i, value) in block.iter().enumerate() {
            let addr = base + layout.handle_block + i as u64 * CAP_SIZE;
            self.machine.store_cap(&maps.code, addr, *value)?;
        }

        // W^X: the page becomes code only now that it is complete.
        self.machine
            .mprotect(&maps.code, base, page_size, Prot::RX)
            .map_err(CmptError::ResourceExhausted)?;
        self.machine.clear_cache(base, page_size);

        if !handle.is_valid() {
            return Err(CmptError::InvalidTarget);
        }

        let otype = id.max(ObjectType::FIRST_USER) as u16;
        self.log(&format!(
            "create: compartment {} otype {:#06x} code {:#x} data {:#x} stack {:#x}+{} pages handle {}",
            id,
            otype,
            base,
            maps.data.base(),
            maps.stack.base(),
            stack_pages,
            handle
        ));
        Ok(Compartment {
            id,
            otype,
            handle,
            identity,
            code_map: maps.code,
            data_map: maps.data,
            stack_map: maps.stack,
            stack_pages,
        })
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Unmap a compartment's regions and forget it.
    pub fn destroy_compartment(&mut self, handle: &CompartmentHandle) -> (Result<(), CmptError>, Vec<Mutation>) {
        if let Err(e) = self.running() {
            return (Err(e), Vec::new());
        }
        let addr = handle.address();
        if self.lookup(handle).is_none() {
            return (Err(CmptError::UnknownCompartment { handle: addr }), Vec::new());
        }
        let cmpt = match self.compartments.remove(&addr) {
            Some(cmpt) => cmpt,
            None => return (Err(CmptError::UnknownCompartment { handle: addr }), Vec::new()),
        };
        let mutation = Mutation::CompartmentDestroyed { id: cmpt.id, handle: addr };

        for map in [cmpt.code_map, cmpt.data_map, cmpt.stack_map] {
            if let Err(e) = self.machine.munmap(&map, map.base(), map.length()) {
                // The record is gone either way; the ledger says so.
                return (Err(CmptError::Unmap(e)), vec![mutation]);
            }
        }
        self.log(&format!("destroy: compartment {} handle {}", cmpt.id, cmpt.handle));
        (Ok(()), vec![mutation])
    }
}
