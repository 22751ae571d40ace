//! Compartment invocation

use alloc::vec::Vec;

use cmpt_axiom::Mutation;
use cmpt_cap::Capability;
use cmpt_hal::HAL;
use cmpt_machine::{c, Fault};

use super::ManagerCore;
use crate::error::CmptError;
use crate::gate::{callee_saved, CallContext, CallTracker};
use crate::invoke::{entry_insn, HANDLE_REG};
use crate::types::CompartmentHandle;

impl<H: HAL> ManagerCore<H> {
    /// Call the compartment behind `handle` with `arg` and return its result.
    ///
    /// A handle that names no live compartment is stale: invoking it is an
    /// integrity fault, as is any break in the call protocol.
    pub fn invoke(&mut self, handle: &CompartmentHandle, arg: Capability) -> (Result<Capability, CmptError>, Vec<Mutation>) {
        (self.try_invoke(handle, arg), Vec::new())
    }

    fn try_invoke(&mut self, handle: &CompartmentHandle, arg: Capability) -> Result<Capability, CmptError> {
        self.running()?;
        let (trampoline, identity, stack) = match self.lookup(handle) {
            Some(cmpt) => (cmpt.code_map.base(), cmpt.identity, cmpt.stack_map),
            None => {
                return Err(self.fatal(Fault::StaleHandle {
                    addr: handle.address(),
                }))
            }
        };

        let regs = self.machine.regs();
        let ctx = CallContext {
            trampoline,
            layout: self.layout,
            identity,
            stack_base: stack.base(),
            stack_limit: stack.limit(),
            caller_cid: regs.cid(),
            caller_csp: regs.csp(),
            callee_saved: callee_saved(regs),
        };

        let regs = self.machine.regs_mut();
        regs.set(c(0), arg);
        regs.set(HANDLE_REG, handle.0);

        let mut tracker = CallTracker::new(ctx);
        if let Err(fault) = self.machine.call(entry_insn(self.config.scheme), &mut tracker) {
            return Err(self.fatal(fault));
        }
        if !tracker.completed() {
            return Err(self.fatal(Fault::ProtocolViolation {
                detail: "call finished without leaving through the trampoline",
            }));
        }
        Ok(self.machine.regs().get(c(0)))
    }
}
