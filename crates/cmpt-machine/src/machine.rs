//! The capability machine
//!
//! [`Machine`] owns memory, the register file and the table of native
//! functions. It executes one instruction per [`Machine::step`] and enforces
//! the capability rules on every fetch, load, store and branch.
//!
//! # Address Space
//!
//! ```text
//! 0x0010_0000  text segment (RX): host call site, native functions
//! 0x4000_0000  mmap area, growing up, never reused
//! ```
//!
//! # Host Calls
//!
//! The host (the process that owns the machine) enters machine code through
//! [`Machine::call`]: the given instruction runs as if it sat at the host call
//! site with PCC set to the code root, so a branch-with-link leaves a return
//! sentry to the next word in `c30`. Execution continues until control comes
//! back to that word.
//!
//! # Faults
//!
//! The first [`Fault`] halts the machine. Every later call reports it again.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use cmpt_cap::{Capability, ObjectType, Perms, RootAuthority, CAP_SIZE, OTYPE_MASK};

use crate::config::MachineConfig;
use crate::error::{Fault, MapError};
use crate::isa::{Insn, Reg, SysReg, INSN_SIZE, MAX_ALIGN_LOG2};
use crate::memory::{Memory, Prot};
use crate::native::{NativeFn, NativeFrame};
use crate::regs::RegisterFile;

/// Base of the text segment.
pub const TEXT_BASE: u64 = 0x0010_0000;
/// Size of the text segment.
pub const TEXT_SIZE: u64 = 0x0010_0000;
/// Address at which host-issued instructions execute.
pub const HOST_CALL_SITE: u64 = TEXT_BASE;
/// Where control lands when a host call returns.
pub const HOST_RETURN: u64 = HOST_CALL_SITE + INSN_SIZE;

const NATIVE_BASE: u64 = TEXT_BASE + 0x1000;
const NATIVE_STRIDE: u64 = 16;

static ROOT_AUTHORITY: spin::Once<Option<RootAuthority>> = spin::Once::new();

/// The process's root authority, claimed for the platform on first use.
pub(crate) fn root_authority() -> Option<&'static RootAuthority> {
    ROOT_AUTHORITY.call_once(RootAuthority::claim).as_ref()
}

/// Auxiliary vector entries holding platform roots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxType {
    /// `AT_CHERI_SEAL_CAP`: authority over every software object type
    SealCap,
    /// `AT_CHERI_CID_CAP`: compartment identity root
    CidCap,
    /// The code root the process runs under
    PccCap,
}

/// What one step executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Insn(Insn),
    /// A native function ran and returned through `c30`
    Native,
}

/// Record of one retired step, handed to the [`StepObserver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepEvent {
    /// Address the step executed at
    pub pc: u64,
    /// PCC address after the step
    pub next_pc: u64,
    pub kind: StepKind,
}

/// Watches execution during a host call. An error halts the machine.
pub trait StepObserver {
    fn observe(&mut self, event: &StepEvent, regs: &RegisterFile) -> Result<(), Fault>;
}

impl<F> StepObserver for F
where
    F: FnMut(&StepEvent, &RegisterFile) -> Result<(), Fault>,
{
    fn observe(&mut self, event: &StepEvent, regs: &RegisterFile) -> Result<(), Fault> {
        self(event, regs)
    }
}

/// The simulated capability machine.
pub struct Machine {
    config: MachineConfig,
    memory: Memory,
    regs: RegisterFile,
    natives: BTreeMap<u64, NativeFn>,
    next_native: u64,
    seal_root: Capability,
    cid_root: Capability,
    pcc_root: Capability,
    /// Architectural unseal authority used by sealed branches
    unseal_all: Capability,
    halted: Option<Fault>,
    retired: u64,
}

impl Machine {
    /// Reset a machine: map the text segment and the host stack, mint roots.
    ///
    /// Fails with [`MapError::InvalidAuthority`] if something other than the
    /// platform took the process's root authority first.
    pub fn new(config: MachineConfig) -> Result<Self, MapError> {
        let authority = root_authority().ok_or(MapError::InvalidAuthority)?;
        let mut memory = Memory::new(config.page_size, config.memory_pages, authority);
        memory.map_text(TEXT_BASE, TEXT_SIZE);
        let stack = memory.mmap(config.host_stack_pages * config.page_size, Prot::RW, Prot::empty())?;

        let pcc_root = authority.new_root(TEXT_BASE, TEXT_SIZE, Perms::RX);
        let mut regs = RegisterFile::default();
        // Host stacks are local: they may only be stored through STORE_LOCAL_CAP.
        regs.set(
            Reg::CSP,
            stack
                .perms_and(Perms::RW)
                .perms_clear(Perms::GLOBAL)
                .with_address(stack.limit()),
        );
        regs.set_pcc(pcc_root.with_address(HOST_CALL_SITE));

        Ok(Self {
            config,
            memory,
            regs,
            natives: BTreeMap::new(),
            next_native: NATIVE_BASE,
            seal_root: authority.new_root(0, OTYPE_MASK + 1, Perms::GLOBAL | Perms::SEAL | Perms::UNSEAL),
            cid_root: authority.new_root(0, u64::MAX, Perms::GLOBAL | Perms::CMPT_ID),
            pcc_root,
            unseal_all: authority.new_root(0, OTYPE_MASK + 1, Perms::UNSEAL),
            halted: None,
            retired: 0,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Host access to the register file between calls.
    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    /// Instructions and native calls retired since reset.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Look up a platform root.
    pub fn getauxptr(&self, kind: AuxType) -> Option<Capability> {
        match kind {
            AuxType::SealCap if self.config.expose_seal_root => Some(self.seal_root),
            AuxType::CidCap if self.config.expose_cid_root => Some(self.cid_root),
            AuxType::PccCap => Some(self.pcc_root),
            _ => None,
        }
    }

    // ========================================================================
    // Halting
    // ========================================================================

    /// The fault that halted the machine, if any.
    pub fn halted(&self) -> Option<Fault> {
        self.halted
    }

    /// Halt with `fault`. Returns the fault the machine is halted with, which
    /// is the first one raised.
    pub fn halt(&mut self, fault: Fault) -> Fault {
        *self.halted.get_or_insert(fault)
    }

    fn trap<T>(&mut self, result: Result<T, Fault>) -> Result<T, Fault> {
        result.map_err(|f| self.halt(f))
    }

    fn running(&self) -> Result<(), Fault> {
        match self.halted {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Virtual memory (host side)
    // ========================================================================

    /// Map fresh memory. See [`Memory::mmap`].
    pub fn mmap(&mut self, len: u64, prot: Prot, max_prot: Prot) -> Result<Capability, MapError> {
        self.memory.mmap(len, prot, max_prot)
    }

    pub fn mprotect(&mut self, auth: &Capability, addr: u64, len: u64, prot: Prot) -> Result<(), MapError> {
        self.memory.mprotect(auth, addr, len, prot)
    }

    pub fn munmap(&mut self, auth: &Capability, addr: u64, len: u64) -> Result<(), MapError> {
        self.memory.munmap(auth, addr, len)
    }

    /// Flush the instruction cache for a range.
    pub fn clear_cache(&mut self, addr: u64, len: u64) {
        self.memory.clear_cache(addr, len)
    }

    // ========================================================================
    // Checked memory access
    // ========================================================================

    fn check_access(auth: &Capability, addr: u64, len: u64, needed: Perms) -> Result<(), Fault> {
        if !auth.is_valid() {
            return Err(Fault::TagViolation { addr });
        }
        if auth.is_sealed() {
            return Err(Fault::SealViolation { addr });
        }
        if !auth.covers(addr, len) {
            return Err(Fault::BoundsViolation { addr });
        }
        if !auth.check_perms(needed) {
            return Err(Fault::PermissionViolation { addr, needed });
        }
        Ok(())
    }

    pub(crate) fn load_cap_via(&self, auth: &Capability, addr: u64) -> Result<Capability, Fault> {
        Self::check_access(auth, addr, CAP_SIZE, Perms::LOAD)?;
        let mut value = self.memory.read_cap(addr)?;
        if !auth.check_perms(Perms::LOAD_CAP) {
            value = value.tag_cleared();
        }
        if !auth.check_perms(Perms::MUTABLE_LOAD) && value.is_valid() && !value.is_sealed() {
            value = value.perms_clear(Perms::mutable_load_strip());
        }
        Ok(value)
    }

    pub(crate) fn store_cap_via(&mut self, auth: &Capability, addr: u64, value: Capability) -> Result<(), Fault> {
        let mut needed = Perms::STORE;
        if value.is_valid() {
            needed |= Perms::STORE_CAP;
            if value.is_local() {
                needed |= Perms::STORE_LOCAL_CAP;
            }
        }
        Self::check_access(auth, addr, CAP_SIZE, needed)?;
        self.memory.write_cap(addr, value)
    }

    pub(crate) fn load_bytes_via(&self, auth: &Capability, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        Self::check_access(auth, addr, buf.len() as u64, Perms::LOAD)?;
        self.memory.read_bytes(addr, buf)
    }

    pub(crate) fn store_bytes_via(&mut self, auth: &Capability, addr: u64, bytes: &[u8]) -> Result<(), Fault> {
        Self::check_access(auth, addr, bytes.len() as u64, Perms::STORE)?;
        self.memory.write_bytes(addr, bytes)
    }

    /// Host load of a capability through `auth`. A fault halts the machine.
    pub fn load_cap(&mut self, auth: &Capability, addr: u64) -> Result<Capability, Fault> {
        self.running()?;
        let r = self.load_cap_via(auth, addr);
        self.trap(r)
    }

    /// Host store of a capability through `auth`. A fault halts the machine.
    pub fn store_cap(&mut self, auth: &Capability, addr: u64, value: Capability) -> Result<(), Fault> {
        self.running()?;
        let r = self.store_cap_via(auth, addr, value);
        self.trap(r)
    }

    /// Host load of plain bytes through `auth`. A fault halts the machine.
    pub fn load_bytes(&mut self, auth: &Capability, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.running()?;
        let r = self.load_bytes_via(auth, addr, buf);
        self.trap(r)
    }

    /// Host store of plain bytes through `auth`. A fault halts the machine.
    pub fn store_bytes(&mut self, auth: &Capability, addr: u64, bytes: &[u8]) -> Result<(), Fault> {
        self.running()?;
        let r = self.store_bytes_via(auth, addr, bytes);
        self.trap(r)
    }

    // ========================================================================
    // Native functions
    // ========================================================================

    /// Place `f` in the text segment and return a sentry to it.
    ///
    /// When control reaches the sentry's address the machine runs `f`, then
    /// returns through `c30`.
    pub fn register_native<F>(&mut self, f: F) -> Result<Capability, MapError>
    where
        F: Fn(&mut NativeFrame<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        let addr = self.next_native;
        if addr + NATIVE_STRIDE > TEXT_BASE + TEXT_SIZE {
            return Err(MapError::OutOfMemory);
        }
        self.next_native += NATIVE_STRIDE;
        self.natives.insert(addr, Arc::new(f));
        Ok(self.pcc_root.with_address(addr).sentry())
    }

    pub(crate) fn check_sysreg(&self, reg: SysReg, pc: u64) -> Result<(), Fault> {
        if reg.is_privileged() && !self.regs.pcc().check_perms(Perms::SYS_REG) {
            return Err(Fault::SystemRegister { addr: pc });
        }
        Ok(())
    }

    pub(crate) fn regs_internal(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run `entry` from the host call site until control returns there.
    ///
    /// Every retired step is reported to `observer`.
    pub fn call(&mut self, entry: Insn, observer: &mut dyn StepObserver) -> Result<(), Fault> {
        self.running()?;
        self.regs.set_pcc(self.pcc_root.with_address(HOST_CALL_SITE));

        let event = self.execute(entry, HOST_CALL_SITE);
        let event = self.trap(event)?;
        let seen = observer.observe(&event, &self.regs);
        self.trap(seen)?;

        let mut steps = 1u64;
        while !self.at_host_return() {
            if steps >= self.config.max_steps {
                return Err(self.halt(Fault::Runaway { steps }));
            }
            let event = self.step();
            let event = self.trap(event)?;
            let seen = observer.observe(&event, &self.regs);
            self.trap(seen)?;
            steps += 1;
        }
        Ok(())
    }

    fn at_host_return(&self) -> bool {
        let pcc = self.regs.pcc();
        pcc.is_valid() && !pcc.is_sealed() && pcc.address() == HOST_RETURN
    }

    /// Execute one step at PCC.
    pub fn step(&mut self) -> Result<StepEvent, Fault> {
        self.running()?;
        let pcc = self.regs.pcc();
        let pc = pcc.address();
        Self::check_fetch(&pcc, pc)?;

        if let Some(native) = self.natives.get(&pc).cloned() {
            self.memory.fetch(pc)?;
            native(&mut NativeFrame::new(self, pc))?;
            let link = self.regs.get(Reg::LR);
            self.branch(link)?;
            self.retired += 1;
            return Ok(StepEvent {
                pc,
                next_pc: self.regs.pcc().address(),
                kind: StepKind::Native,
            });
        }

        let word = self.memory.fetch(pc)?;
        let insn = Insn::decode(word).ok_or(Fault::Undefined { addr: pc, word })?;
        self.execute(insn, pc)
    }

    fn check_fetch(pcc: &Capability, pc: u64) -> Result<(), Fault> {
        if !pcc.is_valid() {
            return Err(Fault::TagViolation { addr: pc });
        }
        if pcc.is_sealed() {
            return Err(Fault::SealViolation { addr: pc });
        }
        if !pcc.check_perms(Perms::EXECUTE) {
            return Err(Fault::PermissionViolation {
                addr: pc,
                needed: Perms::EXECUTE,
            });
        }
        if !pcc.covers(pc, INSN_SIZE) {
            return Err(Fault::BoundsViolation { addr: pc });
        }
        Ok(())
    }

    fn unseal_reserved(&self, cap: &Capability) -> Capability {
        cap.unseal(&self.unseal_all.with_address(cap.otype().0 as u64))
    }

    /// Install `target` in PCC. Sentries are unsealed; other seals fault.
    fn branch(&mut self, target: Capability) -> Result<(), Fault> {
        let addr = target.address();
        if !target.is_valid() {
            return Err(Fault::TagViolation { addr });
        }
        let target = match target.otype() {
            ObjectType::UNSEALED => target,
            ObjectType::RB => self.unseal_reserved(&target),
            _ => return Err(Fault::SealViolation { addr }),
        };
        self.regs.set_pcc(target);
        Ok(())
    }

    fn link(&self, pc: u64) -> Capability {
        self.regs.pcc().with_address(pc + INSN_SIZE).sentry()
    }

    fn sealed_operand(&self, reg: Reg, otype: ObjectType) -> Result<Capability, Fault> {
        let cap = self.regs.get(reg);
        if !cap.is_valid() {
            return Err(Fault::TagViolation { addr: cap.address() });
        }
        if cap.otype() != otype {
            return Err(Fault::SealViolation { addr: cap.address() });
        }
        Ok(self.unseal_reserved(&cap))
    }

    fn execute(&mut self, insn: Insn, pc: u64) -> Result<StepEvent, Fault> {
        let offset = |cap: &Capability, imm: i32| cap.address().wrapping_add(imm as i64 as u64);
        let mut branched = false;

        match insn {
            Insn::Udf => return Err(Fault::Undefined { addr: pc, word: 0 }),
            Insn::AddImm { rd, rn, imm } => {
                let value = self.regs.get(rn).add(imm as i64);
                self.regs.set(rd, value);
            }
            Insn::Stp { rt1, rt2, rn, imm } => {
                let auth = self.regs.get(rn);
                let addr = offset(&auth, imm);
                self.store_cap_via(&auth, addr, self.regs.get(rt1))?;
                self.store_cap_via(&auth, addr + CAP_SIZE, self.regs.get(rt2))?;
            }
            Insn::Ldp { rt1, rt2, rn, imm } => {
                let auth = self.regs.get(rn);
                let addr = offset(&auth, imm);
                let first = self.load_cap_via(&auth, addr)?;
                let second = self.load_cap_via(&auth, addr + CAP_SIZE)?;
                self.regs.set(rt1, first);
                self.regs.set(rt2, second);
            }
            Insn::Str { rt, rn, imm } => {
                let auth = self.regs.get(rn);
                self.store_cap_via(&auth, offset(&auth, imm), self.regs.get(rt))?;
            }
            Insn::Ldr { rt, rn, imm } => {
                let auth = self.regs.get(rn);
                let value = self.load_cap_via(&auth, offset(&auth, imm))?;
                self.regs.set(rt, value);
            }
            Insn::Adr { rd, offset } => {
                let value = self.regs.pcc().with_address(pc.wrapping_add(offset as i64 as u64));
                self.regs.set(rd, value);
            }
            Insn::AlignUp { rd, rn, log2 } => {
                if log2 > MAX_ALIGN_LOG2 {
                    return Err(Fault::Undefined { addr: pc, word: 0 });
                }
                let value = self.regs.get(rn).align_up(1u64 << log2);
                self.regs.set(rd, value);
            }
            Insn::Mov { rd, rn } => {
                let value = self.regs.get(rn);
                self.regs.set(rd, value);
            }
            Insn::Mrs { rd, sysreg } => {
                self.check_sysreg(sysreg, pc)?;
                let value = self.regs.sysreg(sysreg);
                self.regs.set(rd, value);
            }
            Insn::Msr { sysreg, rn } => {
                self.check_sysreg(sysreg, pc)?;
                let value = self.regs.get(rn);
                self.regs.set_sysreg(sysreg, value);
            }
            Insn::Zero { rd } => self.regs.set(rd, Capability::NULL),
            Insn::Blr { rn } => {
                let target = self.regs.get(rn);
                let link = self.link(pc);
                self.branch(target)?;
                self.regs.set(Reg::LR, link);
                branched = true;
            }
            Insn::Ret { rn } => {
                let target = self.regs.get(rn);
                self.branch(target)?;
                branched = true;
            }
            Insn::Brs { rn, rm } => {
                let code = self.regs.get(rn);
                let data = self.regs.get(rm);
                let paired = code.is_valid()
                    && data.is_valid()
                    && code.is_sealed()
                    && code.otype() == data.otype()
                    && !code.otype().is_reserved()
                    && code.check_perms(Perms::EXECUTE | Perms::CAP_INVOKE)
                    && data.check_perms(Perms::CAP_INVOKE)
                    && !data.check_perms(Perms::EXECUTE);
                if !paired {
                    return Err(Fault::SealedPairMismatch { addr: pc });
                }
                let code = self.unseal_reserved(&code);
                let data = self.unseal_reserved(&data);
                self.regs.set_pcc(code);
                self.regs.set(Reg::c(29), data);
                branched = true;
            }
            Insn::LdpBlr { rt, rn } => {
                let pair = self.sealed_operand(rn, ObjectType::LPB)?;
                let data = self.load_cap_via(&pair, pair.address())?;
                let code = self.load_cap_via(&pair, pair.address() + CAP_SIZE)?;
                let link = self.link(pc);
                self.branch(code)?;
                self.regs.set(rt, data);
                self.regs.set(Reg::LR, link);
                branched = true;
            }
            Insn::BlrMem { rn, imm } => {
                let slot = self.sealed_operand(rn, ObjectType::LB)?;
                let target = self.load_cap_via(&slot, offset(&slot, imm))?;
                let link = self.link(pc);
                self.branch(target)?;
                self.regs.set(Reg::LR, link);
                branched = true;
            }
        }

        if !branched {
            let next = self.regs.pcc().with_address(pc + INSN_SIZE);
            self.regs.set_pcc(next);
        }
        self.retired += 1;
        Ok(StepEvent {
            pc,
            next_pc: self.regs.pcc().address(),
            kind: StepKind::Insn(insn),
        })
    }
}
