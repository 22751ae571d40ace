//! Register file

use cmpt_cap::Capability;

use crate::isa::{Reg, SysReg};

/// General-purpose capability registers `c0`..`c30` plus `csp`.
pub const GPR_COUNT: usize = 32;

/// Architectural register state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    c: [Capability; GPR_COUNT],
    pcc: Capability,
    sysregs: [Capability; SysReg::COUNT],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            c: [Capability::NULL; GPR_COUNT],
            pcc: Capability::NULL,
            sysregs: [Capability::NULL; SysReg::COUNT],
        }
    }
}

impl RegisterFile {
    /// Read a register.
    pub fn get(&self, reg: Reg) -> Capability {
        self.c[reg.index()]
    }

    /// Write a register.
    pub fn set(&mut self, reg: Reg, value: Capability) {
        self.c[reg.index()] = value;
    }

    /// Capability stack pointer.
    pub fn csp(&self) -> Capability {
        self.get(Reg::CSP)
    }

    /// Program counter capability.
    pub fn pcc(&self) -> Capability {
        self.pcc
    }

    pub(crate) fn set_pcc(&mut self, pcc: Capability) {
        self.pcc = pcc;
    }

    /// Read a system register without an access check.
    pub fn sysreg(&self, reg: SysReg) -> Capability {
        self.sysregs[reg.index()]
    }

    /// Write a system register without an access check.
    pub fn set_sysreg(&mut self, reg: SysReg, value: Capability) {
        self.sysregs[reg.index()] = value;
    }

    /// Compartment identifier register.
    pub fn cid(&self) -> Capability {
        self.sysreg(SysReg::CidEl0)
    }

    /// Registers in `range` that hold anything other than the null capability.
    pub fn non_null_in(&self, range: core::ops::RangeInclusive<u8>) -> impl Iterator<Item = Reg> + '_ {
        range
            .map(Reg::c)
            .filter(move |r| self.get(*r) != Capability::NULL)
    }
}
