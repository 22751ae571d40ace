//! Call-state tracking
//!
//! [`CallTracker`] follows one invocation through the trampoline, step by
//! step, and checks every transition of the call protocol:
//!
//! ```text
//! CallerRunning ──sealed branch──▶ SwitchingIn ──blr target──▶ TargetRunning
//!       ▲                                                           │
//!       └────────────ret to caller──── SwitchingOut ◀──target returns┘
//! ```
//!
//! While switching, only trampoline code may run, and CID and the stack
//! pointer must each be swapped exactly once. At the two hand-over points the
//! register file must hold nothing beyond what the protocol passes across.

use cmpt_cap::Capability;
use cmpt_machine::{
    c, Fault, Insn, Reg, RegisterFile, StepEvent, StepKind, StepObserver, SysReg, HOST_RETURN,
};

use crate::trampoline::Layout;

/// Where an invocation is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    CallerRunning,
    SwitchingIn,
    TargetRunning,
    SwitchingOut,
}

/// What the tracker knows about the compartment being called.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
    /// Address the trampoline was relocated to
    pub trampoline: u64,
    pub layout: Layout,
    /// Identity the callee must run under
    pub identity: Capability,
    /// Compartment stack bounds
    pub stack_base: u64,
    pub stack_limit: u64,
    /// Caller state to restore
    pub caller_cid: Capability,
    pub caller_csp: Capability,
    /// Caller's c19..c29
    pub callee_saved: [Capability; CALLEE_SAVED],
}

/// Registers the callee preserves, c19 through c29.
pub const CALLEE_SAVED: usize = 11;
const FIRST_CALLEE_SAVED: u8 = 19;

/// Snapshot of the callee-saved registers.
pub fn callee_saved(regs: &RegisterFile) -> [Capability; CALLEE_SAVED] {
    ::core::array::from_fn(|i| regs.get(c(FIRST_CALLEE_SAVED + i as u8)))
}

/// Step observer enforcing the call protocol.
pub struct CallTracker {
    ctx: CallContext,
    state: CallState,
    cid_writes: u32,
    stack_swaps: u32,
    completed: bool,
}

fn violation(detail: &'static str) -> Fault {
    Fault::ProtocolViolation { detail }
}

impl CallTracker {
    pub fn new(ctx: CallContext) -> Self {
        Self {
            ctx,
            state: CallState::CallerRunning,
            cid_writes: 0,
            stack_swaps: 0,
            completed: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// True once control came back to the caller through the trampoline.
    pub fn completed(&self) -> bool {
        self.completed
    }

    fn at(&self, offset: u64) -> u64 {
        self.ctx.trampoline + offset
    }

    fn in_trampoline(&self, pc: u64) -> bool {
        pc >= self.ctx.trampoline && pc < self.at(self.ctx.layout.code_size)
    }

    fn begin_switch(&mut self, next: CallState) {
        self.state = next;
        self.cid_writes = 0;
        self.stack_swaps = 0;
    }

    fn count_swaps(&mut self, kind: &StepKind) {
        match kind {
            StepKind::Insn(Insn::Msr { sysreg: SysReg::CidEl0, .. }) => self.cid_writes += 1,
            StepKind::Insn(Insn::Mov { rd, .. }) if *rd == Reg::CSP => self.stack_swaps += 1,
            _ => {}
        }
    }

    fn check_swapped_once(&self) -> Result<(), Fault> {
        if self.cid_writes != 1 {
            return Err(violation("CID not swapped exactly once"));
        }
        if self.stack_swaps != 1 {
            return Err(violation("stack not swapped exactly once"));
        }
        Ok(())
    }

    /// Hand-over to the target: callee identity, callee stack, and nothing
    /// in the registers but the argument, the stack and the target.
    fn check_entry(&self, regs: &RegisterFile) -> Result<(), Fault> {
        self.check_swapped_once()?;
        if regs.cid() != self.ctx.identity {
            return Err(violation("target entered under the wrong identity"));
        }
        let sp = regs.csp();
        if !sp.is_valid() || sp.base() < self.ctx.stack_base || sp.limit() > self.ctx.stack_limit {
            return Err(violation("target entered off the compartment stack"));
        }
        if regs.non_null_in(1..=28).next().is_some() {
            return Err(violation("registers not scrubbed on entry"));
        }
        Ok(())
    }

    /// Hand-back to the caller: caller identity and stack, callee-saved
    /// registers as the caller left them, scratch registers clear.
    fn check_exit(&self, regs: &RegisterFile) -> Result<(), Fault> {
        self.check_swapped_once()?;
        if regs.cid() != self.ctx.caller_cid {
            return Err(violation("caller identity not restored"));
        }
        if regs.csp() != self.ctx.caller_csp {
            return Err(violation("caller stack not restored"));
        }
        if callee_saved(regs) != self.ctx.callee_saved {
            return Err(violation("callee-saved registers not restored"));
        }
        if regs.non_null_in(1..=18).next().is_some() {
            return Err(violation("registers not scrubbed on exit"));
        }
        Ok(())
    }
}

impl StepObserver for CallTracker {
    fn observe(&mut self, event: &StepEvent, regs: &RegisterFile) -> Result<(), Fault> {
        match self.state {
            CallState::CallerRunning => {
                if self.completed {
                    return Err(violation("caller re-entered after return"));
                }
                if event.next_pc != self.ctx.trampoline {
                    return Err(violation("handle did not enter the trampoline"));
                }
                self.begin_switch(CallState::SwitchingIn);
            }
            CallState::SwitchingIn => {
                if !self.in_trampoline(event.pc) {
                    return Err(violation("left the trampoline while switching in"));
                }
                self.count_swaps(&event.kind);
                if event.pc == self.at(self.ctx.layout.target_call) {
                    // `blr` only wrote c30, so the scrub is still visible.
                    self.check_entry(regs)?;
                    self.state = CallState::TargetRunning;
                }
            }
            CallState::TargetRunning => {
                if event.next_pc == self.at(self.ctx.layout.target_return) {
                    if regs.cid() != self.ctx.identity {
                        return Err(violation("target returned under another identity"));
                    }
                    self.begin_switch(CallState::SwitchingOut);
                }
            }
            CallState::SwitchingOut => {
                if !self.in_trampoline(event.pc) {
                    return Err(violation("left the trampoline while switching out"));
                }
                self.count_swaps(&event.kind);
                if event.pc == self.at(self.ctx.layout.caller_return) {
                    if event.next_pc != HOST_RETURN {
                        return Err(violation("returned somewhere other than the caller"));
                    }
                    self.check_exit(regs)?;
                    self.state = CallState::CallerRunning;
                    self.completed = true;
                }
            }
        }
        Ok(())
    }
}
