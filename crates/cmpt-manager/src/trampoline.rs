//! Compartment switch trampoline
//!
//! The trampoline is the only code that runs while a switch is half done.
//! One copy is relocated into every compartment's code page, immediately
//! followed by the compartment descriptor, which it finds PC-relatively.
//!
//! ```text
//! _trampoline       save c19..c30 on the caller stack, load identity and
//!                   target from the descriptor, branch to the entry gate
//! _cmpt_start       swap CID, swap stacks, scrub c1..c28, call the target,
//!                   scrub c1..c18, branch to the exit gate
//! _cmpt_end         restore CID, swap stacks back, restore c19..c30, return
//! _trampoline_end   descriptor follows, 16-byte aligned
//! ```
//!
//! Descriptor layout (capability slots):
//!
//! | offset | slot |
//! |---|---|
//! | 0 | identity (sentry) |
//! | 16 | target (sentry) |
//! | 32 | entry gate (sealed with the identity's type) |
//! | 48 | runtime record (sealed with the identity's type) |
//! | 64 | exit gate (sealed with the identity's type) |
//!
//! Runtime record: `[0]` the stack not currently in use, `[16]` the caller's
//! CID while the compartment runs.

use cmpt_cap::CAP_SIZE;
use cmpt_machine::{c, AsmError, Assembler, Insn, Program, Reg, SysReg, INSN_SIZE};

pub const TRAMPOLINE: &str = "_trampoline";
pub const CMPT_START: &str = "_cmpt_start";
pub const CMPT_END: &str = "_cmpt_end";
pub const TRAMPOLINE_END: &str = "_trampoline_end";

/// Descriptor slot offsets.
pub const DESC_IDENTITY: u64 = 0;
pub const DESC_TARGET: u64 = CAP_SIZE;
pub const DESC_ENTRY: u64 = 2 * CAP_SIZE;
pub const DESC_DATA: u64 = 3 * CAP_SIZE;
pub const DESC_EXIT: u64 = 4 * CAP_SIZE;
/// Size of the descriptor.
pub const DESC_SIZE: u64 = 5 * CAP_SIZE;

/// Runtime record slot offsets.
pub const RECORD_STACK: u64 = 0;
pub const RECORD_CALLER_CID: u64 = CAP_SIZE;
/// Size of the runtime record.
pub const RECORD_SIZE: u64 = 2 * CAP_SIZE;

/// Size of the caller frame holding c19..c30.
pub const FRAME: i32 = 12 * CAP_SIZE as i32;

/// Callee-saved pairs, in frame order.
const SAVED_PAIRS: [(u8, u8); 6] = [(29, 30), (27, 28), (25, 26), (23, 24), (21, 22), (19, 20)];

/// Assemble the trampoline.
pub fn assemble() -> Result<Program, AsmError> {
    let mut asm = Assembler::new();
    let pair_offset = |i: usize| (i as i32) * 2 * CAP_SIZE as i32;

    asm.label(TRAMPOLINE)
        .emit(Insn::AddImm { rd: Reg::CSP, rn: Reg::CSP, imm: -FRAME });
    for (i, &(a, b)) in SAVED_PAIRS.iter().enumerate() {
        asm.emit(Insn::Stp { rt1: c(a), rt2: c(b), rn: Reg::CSP, imm: pair_offset(i) });
    }
    descriptor_address(&mut asm);
    asm.emit_all([
        // identity, target
        Insn::Ldp { rt1: c(26), rt2: c(30), rn: c(27), imm: DESC_IDENTITY as i32 },
        // entry gate, runtime record
        Insn::Ldp { rt1: c(27), rt2: c(28), rn: c(27), imm: DESC_ENTRY as i32 },
        Insn::Brs { rn: c(27), rm: c(28) },
    ]);

    // c29: runtime record, c26: identity, c30: target
    asm.label(CMPT_START).emit_all([
        Insn::Mrs { rd: c(28), sysreg: SysReg::CidEl0 },
        Insn::Str { rt: c(28), rn: c(29), imm: RECORD_CALLER_CID as i32 },
        Insn::Msr { sysreg: SysReg::CidEl0, rn: c(26) },
        Insn::Mov { rd: c(28), rn: Reg::CSP },
        Insn::Ldr { rt: c(27), rn: c(29), imm: RECORD_STACK as i32 },
        Insn::Str { rt: c(28), rn: c(29), imm: RECORD_STACK as i32 },
        Insn::Mov { rd: c(29), rn: c(27) },
        Insn::Mov { rd: Reg::CSP, rn: c(29) },
    ]);
    asm.emit_all((1..=28).map(|n| Insn::Zero { rd: c(n) }))
        .emit(Insn::Blr { rn: c(30) })
        .emit_all((1..=18).map(|n| Insn::Zero { rd: c(n) }));
    descriptor_address(&mut asm);
    asm.emit_all([
        // runtime record, exit gate
        Insn::Ldp { rt1: c(28), rt2: c(27), rn: c(27), imm: DESC_DATA as i32 },
        Insn::Brs { rn: c(27), rm: c(28) },
    ]);

    // c29: runtime record
    asm.label(CMPT_END).emit_all([
        Insn::Ldr { rt: c(28), rn: c(29), imm: RECORD_CALLER_CID as i32 },
        Insn::Msr { sysreg: SysReg::CidEl0, rn: c(28) },
        Insn::Mov { rd: c(28), rn: Reg::CSP },
        Insn::Ldr { rt: c(27), rn: c(29), imm: RECORD_STACK as i32 },
        Insn::Str { rt: c(28), rn: c(29), imm: RECORD_STACK as i32 },
        Insn::Mov { rd: Reg::CSP, rn: c(27) },
    ]);
    for (i, &(a, b)) in SAVED_PAIRS.iter().enumerate().rev() {
        asm.emit(Insn::Ldp { rt1: c(a), rt2: c(b), rn: Reg::CSP, imm: pair_offset(i) });
    }
    asm.emit_all([
        Insn::AddImm { rd: Reg::CSP, rn: Reg::CSP, imm: FRAME },
        Insn::Ret { rn: c(30) },
        Insn::Udf,
    ]);
    asm.label(TRAMPOLINE_END);

    asm.finish()
}

/// `c27 = align_up(&_trampoline_end, 16)`
fn descriptor_address(asm: &mut Assembler) {
    asm.adr(c(27), TRAMPOLINE_END)
        .emit(Insn::AlignUp { rd: c(27), rn: c(27), log2: 4 });
}

/// Byte offsets of the trampoline's landmarks, read from an assembled
/// program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Entry gate target
    pub cmpt_start: u64,
    /// Exit gate target
    pub cmpt_end: u64,
    /// Size of the code
    pub code_size: u64,
    /// The `blr` that calls the target
    pub target_call: u64,
    /// Where the target returns to
    pub target_return: u64,
    /// The final `ret` back to the caller
    pub caller_return: u64,
    /// Descriptor offset (code size rounded up to a capability)
    pub descriptor: u64,
    /// Handle block offset
    pub handle_block: u64,
    /// Code, descriptor and handle block together
    pub object_size: u64,
}

/// Size of the handle block after the descriptor.
pub const HANDLE_BLOCK_SIZE: u64 = 2 * CAP_SIZE;

impl Layout {
    /// Locate every landmark in `program`. `None` if a label is missing.
    pub fn of(program: &Program) -> Option<Layout> {
        let cmpt_start = program.label(CMPT_START)?;
        let cmpt_end = program.label(CMPT_END)?;
        let code_size = program.label(TRAMPOLINE_END)?;
        // 28 scrubs after the 8-instruction switch, then the call
        let target_call = cmpt_start + (8 + 28) * INSN_SIZE;
        // restore (6), reload (6), `add csp`, then `ret`
        let caller_return = cmpt_end + (6 + 6 + 1) * INSN_SIZE;
        let descriptor = (code_size + CAP_SIZE - 1) & !(CAP_SIZE - 1);
        let handle_block = descriptor + DESC_SIZE;
        Some(Layout {
            cmpt_start,
            cmpt_end,
            code_size,
            target_call,
            target_return: target_call + INSN_SIZE,
            caller_return,
            descriptor,
            handle_block,
            object_size: handle_block + HANDLE_BLOCK_SIZE,
        })
    }
}
