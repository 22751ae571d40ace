//! Invocation convention
//!
//! A handle is a sealed, read-only capability into the compartment's handle
//! block. The caller puts the argument in `c0` and the handle in
//! [`HANDLE_REG`], then executes the scheme's sealed-load branch, which
//! unseals the handle, loads the trampoline entry through it and jumps there
//! with a return link in `c30`. The result comes back in `c0`.

use cmpt_cap::{Capability, Perms};
use cmpt_machine::{c, Insn, Reg};

use crate::config::SealingScheme;
use crate::trampoline::{Layout, DESC_SIZE};

/// Register the handle is passed in.
pub const HANDLE_REG: Reg = c(10);

/// Register the LPB descriptor lands in. The entry scrub clears it.
pub const DATA_REG: Reg = c(9);

/// Read-only view used for the handle and the descriptor copy.
const READ_ONLY: Perms = Perms::GLOBAL.union(Perms::LOAD).union(Perms::LOAD_CAP);

/// The instruction the caller executes to enter a compartment.
pub fn entry_insn(scheme: SealingScheme) -> Insn {
    match scheme {
        SealingScheme::Lpb => Insn::LdpBlr {
            rt: DATA_REG,
            rn: HANDLE_REG,
        },
        SealingScheme::Lb => Insn::BlrMem {
            rn: HANDLE_REG,
            imm: 0,
        },
    }
}

/// Handle block contents and the sealed handle for a compartment.
///
/// `object` covers the relocated trampoline, its descriptor and the handle
/// block, with its address at the trampoline.
pub fn build_handle(scheme: SealingScheme, object: &Capability, layout: &Layout) -> ([Capability; 2], Capability) {
    let base = object.base();
    let code = object.perms_and(Perms::RX).with_address(base);
    let reader = object
        .perms_and(READ_ONLY)
        .with_address(base + layout.handle_block);
    match scheme {
        SealingScheme::Lpb => {
            let descriptor = object
                .with_address(base + layout.descriptor)
                .bounds_set_exact(DESC_SIZE)
                .perms_and(READ_ONLY);
            ([descriptor, code], reader.lpb_sentry())
        }
        SealingScheme::Lb => ([code, Capability::NULL], reader.lb_sentry()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trampoline;
    use cmpt_cap::ObjectType;
    use cmpt_machine::{Machine, MachineConfig, Prot};

    fn object(layout: &Layout) -> Capability {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        machine
            .mmap(0x1000, Prot::RW | Prot::CAP_INVOKE, Prot::RWX)
            .unwrap()
            .bounds_set_exact(layout.object_size)
    }

    fn layout() -> Layout {
        Layout::of(&trampoline::assemble().unwrap()).unwrap()
    }

    #[test]
    fn test_lpb_handle_points_at_pair() {
        let layout = layout();
        let obj = object(&layout);
        let ([data, code], handle) = build_handle(SealingScheme::Lpb, &obj, &layout);

        assert_eq!(handle.otype(), ObjectType::LPB);
        assert_eq!(handle.address(), obj.base() + layout.handle_block);
        assert!(!handle.check_perms(Perms::STORE));
        assert!(!handle.check_perms(Perms::EXECUTE));

        assert_eq!(data.base(), obj.base() + layout.descriptor);
        assert_eq!(data.length(), DESC_SIZE);
        assert!(!data.check_perms(Perms::STORE));
        assert_eq!(code.address(), obj.base());
        assert!(code.check_perms(Perms::EXECUTE));
        assert!(!code.check_perms(Perms::CAP_INVOKE));
    }

    #[test]
    fn test_lb_handle_points_at_code() {
        let layout = layout();
        let obj = object(&layout);
        let ([code, unused], handle) = build_handle(SealingScheme::Lb, &obj, &layout);
        assert_eq!(handle.otype(), ObjectType::LB);
        assert!(code.check_perms(Perms::EXECUTE));
        assert_eq!(unused, Capability::NULL);
        assert_eq!(entry_insn(SealingScheme::Lb), Insn::BlrMem { rn: c(10), imm: 0 });
    }

    #[test]
    fn test_lpb_descriptor_lands_in_a_scratch_register() {
        let Insn::LdpBlr { rt, rn } = entry_insn(SealingScheme::Lpb) else {
            panic!("lpb enters with ldpblr");
        };
        assert_eq!(rn, HANDLE_REG);
        assert_eq!(rt, DATA_REG);
        // Cleared by the entry scrub, never one of the caller's c19..c29.
        assert!((1..=18).contains(&rt.index()));
    }
}
