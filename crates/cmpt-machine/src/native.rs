//! Native functions
//!
//! A native function is host Rust code placed at an address in the text
//! segment. It runs with the machine's registers and memory as they are when
//! control reaches it, and every memory access it makes goes through a
//! capability, with the same checks instructions get.

use alloc::sync::Arc;

use cmpt_cap::{Capability, CAP_SIZE};

use crate::error::Fault;
use crate::isa::{Reg, SysReg};
use crate::machine::Machine;

/// A registered native function.
pub type NativeFn = Arc<dyn Fn(&mut NativeFrame<'_>) -> Result<(), Fault> + Send + Sync>;

/// The view a native function has of the machine while it runs.
pub struct NativeFrame<'a> {
    machine: &'a mut Machine,
    pc: u64,
}

impl<'a> NativeFrame<'a> {
    pub(crate) fn new(machine: &'a mut Machine, pc: u64) -> Self {
        Self { machine, pc }
    }

    /// Address the function was entered at.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// The argument register, `c0`.
    pub fn arg(&self) -> Capability {
        self.machine.regs().get(Reg::c(0))
    }

    /// Set the result register, `c0`.
    pub fn set_result(&mut self, value: Capability) {
        self.set_reg(Reg::c(0), value);
    }

    pub fn reg(&self, reg: Reg) -> Capability {
        self.machine.regs().get(reg)
    }

    pub fn set_reg(&mut self, reg: Reg, value: Capability) {
        self.machine.regs_internal().set(reg, value);
    }

    /// Current stack pointer.
    pub fn csp(&self) -> Capability {
        self.machine.regs().csp()
    }

    /// Program counter capability the function runs under.
    pub fn pcc(&self) -> Capability {
        self.machine.regs().pcc()
    }

    // === Memory ===

    pub fn load_cap(&self, auth: &Capability, addr: u64) -> Result<Capability, Fault> {
        self.machine.load_cap_via(auth, addr)
    }

    pub fn store_cap(&mut self, auth: &Capability, addr: u64, value: Capability) -> Result<(), Fault> {
        self.machine.store_cap_via(auth, addr, value)
    }

    pub fn load_bytes(&self, auth: &Capability, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.machine.load_bytes_via(auth, addr, buf)
    }

    pub fn store_bytes(&mut self, auth: &Capability, addr: u64, bytes: &[u8]) -> Result<(), Fault> {
        self.machine.store_bytes_via(auth, addr, bytes)
    }

    pub fn load_u32(&self, auth: &Capability, addr: u64) -> Result<u32, Fault> {
        let mut buf = [0u8; 4];
        self.load_bytes(auth, addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn store_u32(&mut self, auth: &Capability, addr: u64, value: u32) -> Result<(), Fault> {
        self.store_bytes(auth, addr, &value.to_le_bytes())
    }

    pub fn load_u64(&self, auth: &Capability, addr: u64) -> Result<u64, Fault> {
        let mut buf = [0u8; 8];
        self.load_bytes(auth, addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn store_u64(&mut self, auth: &Capability, addr: u64, value: u64) -> Result<(), Fault> {
        self.store_bytes(auth, addr, &value.to_le_bytes())
    }

    /// Push a capability onto the stack.
    pub fn push(&mut self, value: Capability) -> Result<(), Fault> {
        let sp = self.csp().add(-(CAP_SIZE as i64));
        self.store_cap(&sp, sp.address(), value)?;
        self.set_reg(Reg::CSP, sp);
        Ok(())
    }

    /// Pop a capability off the stack.
    pub fn pop(&mut self) -> Result<Capability, Fault> {
        let sp = self.csp();
        let value = self.load_cap(&sp, sp.address())?;
        self.set_reg(Reg::CSP, sp.add(CAP_SIZE as i64));
        Ok(value)
    }

    // === System registers ===

    pub fn read_sysreg(&self, reg: SysReg) -> Result<Capability, Fault> {
        self.machine.check_sysreg(reg, self.pc)?;
        Ok(self.machine.regs().sysreg(reg))
    }

    pub fn write_sysreg(&mut self, reg: SysReg, value: Capability) -> Result<(), Fault> {
        self.machine.check_sysreg(reg, self.pc)?;
        self.machine.regs_internal().set_sysreg(reg, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MachineConfig;
    use crate::isa::{c, Insn};
    use crate::machine::{Machine, StepEvent};
    use crate::regs::RegisterFile;
    use cmpt_cap::{Capability, Perms};

    use super::*;

    fn run(m: &mut Machine, f: Capability) -> Result<(), Fault> {
        m.regs_mut().set(c(1), f);
        m.call(Insn::Blr { rn: c(1) }, &mut |_: &StepEvent, _: &RegisterFile| -> Result<(), Fault> { Ok(()) })
    }

    #[test]
    fn test_push_pop_on_host_stack() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        let before = m.regs().csp();
        let f = m
            .register_native(|frame| {
                let token = frame.pcc();
                frame.push(token)?;
                let back = frame.pop()?;
                frame.set_result(Capability::from_int(back.is_valid() as u64));
                Ok(())
            })
            .unwrap();
        run(&mut m, f).unwrap();
        assert_eq!(m.regs().get(c(0)).address(), 1);
        assert_eq!(m.regs().csp(), before);
    }

    #[test]
    fn test_data_through_capability() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        let buf = m.mmap(4096, crate::memory::Prot::RW, crate::memory::Prot::empty()).unwrap();
        m.store_bytes(&buf, buf.base(), &[2, 0, 0, 0, 3, 0, 0, 0]).unwrap();
        let f = m
            .register_native(|frame| {
                let buf = frame.arg();
                let x = frame.load_u32(&buf, buf.address())?;
                let y = frame.load_u32(&buf, buf.address() + 4)?;
                frame.store_u32(&buf, buf.address() + 8, x + y)
            })
            .unwrap();
        m.regs_mut().set(c(0), buf.perms_and(Perms::RW));
        run(&mut m, f).unwrap();

        let mut out = [0u8; 4];
        m.load_bytes(&buf, buf.base() + 8, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 5);
    }

    #[test]
    fn test_read_only_argument_cannot_be_written() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        let buf = m.mmap(4096, crate::memory::Prot::RW, crate::memory::Prot::empty()).unwrap();
        let f = m
            .register_native(|frame| {
                let buf = frame.arg();
                frame.store_u32(&buf, buf.address(), 1)
            })
            .unwrap();
        m.regs_mut().set(c(0), buf.perms_and(Perms::GLOBAL | Perms::LOAD));
        assert!(matches!(
            run(&mut m, f),
            Err(Fault::PermissionViolation { .. })
        ));
    }
}
