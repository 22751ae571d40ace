//! Instruction set and its 32-bit encoding
//!
//! The machine runs a small capability instruction set: just what the
//! compartment trampoline and the invocation paths use.
//!
//! # Encoding
//!
//! ```text
//!  31    27 26          15 14    10 9      5 4      0
//! ┌────────┬──────────────┬────────┬────────┬────────┐
//! │   op   │   imm12 (s)  │   c    │   b    │   a    │
//! └────────┴──────────────┴────────┴────────┴────────┘
//! ```
//!
//! Register fields name `c0`..`c30`; 31 names `csp`. Memory offsets and stack
//! adjustments are scaled by 16, `adr` offsets by 4. The all-zero word is
//! `udf`, so zeroed memory never executes.

use core::fmt;

use cmpt_cap::CAP_SIZE;

/// A capability register: `c0`..`c30`, or `csp` (31).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(u8);

impl Reg {
    /// The capability stack pointer.
    pub const CSP: Reg = Reg(31);
    /// Link register.
    pub const LR: Reg = Reg(30);

    /// Register `cN`. `n` is taken modulo 32.
    pub const fn c(n: u8) -> Reg {
        Reg(n & 31)
    }

    /// Register file index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Reg::CSP {
            f.write_str("csp")
        } else {
            write!(f, "c{}", self.0)
        }
    }
}

/// Shorthand for [`Reg::c`].
pub const fn c(n: u8) -> Reg {
    Reg::c(n)
}

/// System registers reachable by `mrs`/`msr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SysReg {
    /// Compartment identifier. Accessible without SYS_REG.
    CidEl0,
    /// Capability control register
    CctlrEl0,
    /// Restricted default data capability
    RddcEl0,
}

impl SysReg {
    /// Number of system registers.
    pub const COUNT: usize = 3;

    /// True if access needs SYS_REG in PCC.
    pub fn is_privileged(self) -> bool {
        !matches!(self, SysReg::CidEl0)
    }

    pub fn index(self) -> usize {
        match self {
            SysReg::CidEl0 => 0,
            SysReg::CctlrEl0 => 1,
            SysReg::RddcEl0 => 2,
        }
    }

    fn from_index(i: u32) -> Option<SysReg> {
        match i {
            0 => Some(SysReg::CidEl0),
            1 => Some(SysReg::CctlrEl0),
            2 => Some(SysReg::RddcEl0),
            _ => None,
        }
    }
}

impl fmt::Display for SysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SysReg::CidEl0 => "CID_EL0",
            SysReg::CctlrEl0 => "CCTLR_EL0",
            SysReg::RddcEl0 => "RDDC_EL0",
        })
    }
}

/// One machine instruction. Immediates are byte offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insn {
    /// Permanently undefined
    Udf,
    /// `add rd, rn, #imm` (negative for `sub`)
    AddImm { rd: Reg, rn: Reg, imm: i32 },
    /// `stp rt1, rt2, [rn, #imm]`
    Stp { rt1: Reg, rt2: Reg, rn: Reg, imm: i32 },
    /// `ldp rt1, rt2, [rn, #imm]`
    Ldp { rt1: Reg, rt2: Reg, rn: Reg, imm: i32 },
    /// `str rt, [rn, #imm]`
    Str { rt: Reg, rn: Reg, imm: i32 },
    /// `ldr rt, [rn, #imm]`
    Ldr { rt: Reg, rn: Reg, imm: i32 },
    /// `adr rd, pc + offset`, derived from PCC
    Adr { rd: Reg, offset: i32 },
    /// `alignu rd, rn, #log2`
    AlignUp { rd: Reg, rn: Reg, log2: u8 },
    /// `mov rd, rn`
    Mov { rd: Reg, rn: Reg },
    /// `mrs rd, sysreg`
    Mrs { rd: Reg, sysreg: SysReg },
    /// `msr sysreg, rn`
    Msr { sysreg: SysReg, rn: Reg },
    /// `mov wN, #0`: clears the whole capability register
    Zero { rd: Reg },
    /// `blr rn`
    Blr { rn: Reg },
    /// `ret rn`
    Ret { rn: Reg },
    /// `brs c29, rn, rm`: branch to sealed pair (code `rn`, data `rm`)
    Brs { rn: Reg, rm: Reg },
    /// `ldpblr rt, [rn]`: load pair through an LPB-sealed capability and branch
    LdpBlr { rt: Reg, rn: Reg },
    /// `blr [rn, #imm]`: load through an LB-sealed capability and branch
    BlrMem { rn: Reg, imm: i32 },
}

/// Size of one encoded instruction.
pub const INSN_SIZE: u64 = 4;

/// Immediate that cannot be encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeError {
    pub insn: Insn,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "immediate out of range or misaligned in `{}`", self.insn)
    }
}

const IMM_BITS: u32 = 12;
/// Largest alignment `alignu` can express, as a power of two.
pub const MAX_ALIGN_LOG2: u8 = 12;
const IMM_MIN: i32 = -(1 << (IMM_BITS - 1));
const IMM_MAX: i32 = (1 << (IMM_BITS - 1)) - 1;

mod op {
    pub const UDF: u32 = 0;
    pub const ADD_IMM: u32 = 1;
    pub const STP: u32 = 2;
    pub const LDP: u32 = 3;
    pub const STR: u32 = 4;
    pub const LDR: u32 = 5;
    pub const ADR: u32 = 6;
    pub const ALIGN_UP: u32 = 7;
    pub const MOV: u32 = 8;
    pub const MRS: u32 = 9;
    pub const MSR: u32 = 10;
    pub const ZERO: u32 = 11;
    pub const BLR: u32 = 12;
    pub const RET: u32 = 13;
    pub const BRS: u32 = 14;
    pub const LDP_BLR: u32 = 15;
    pub const BLR_MEM: u32 = 16;
}

fn scaled(insn: Insn, value: i32, scale: i32) -> Result<u32, EncodeError> {
    if value % scale != 0 {
        return Err(EncodeError { insn });
    }
    let units = value / scale;
    if !(IMM_MIN..=IMM_MAX).contains(&units) {
        return Err(EncodeError { insn });
    }
    Ok((units as u32) & ((1 << IMM_BITS) - 1))
}

fn pack(op: u32, a: Reg, b: Reg, c: Reg, imm: u32) -> u32 {
    (op << 27) | (imm << 15) | ((c.0 as u32) << 10) | ((b.0 as u32) << 5) | a.0 as u32
}

const CAP: i32 = CAP_SIZE as i32;
const R0: Reg = Reg(0);

impl Insn {
    /// Encode into one 32-bit word.
    pub fn encode(&self) -> Result<u32, EncodeError> {
        let insn = *self;
        Ok(match insn {
            Insn::Udf => 0,
            Insn::AddImm { rd, rn, imm } => pack(op::ADD_IMM, rd, rn, R0, scaled(insn, imm, CAP)?),
            Insn::Stp { rt1, rt2, rn, imm } => pack(op::STP, rt1, rt2, rn, scaled(insn, imm, CAP)?),
            Insn::Ldp { rt1, rt2, rn, imm } => pack(op::LDP, rt1, rt2, rn, scaled(insn, imm, CAP)?),
            Insn::Str { rt, rn, imm } => pack(op::STR, rt, rn, R0, scaled(insn, imm, CAP)?),
            Insn::Ldr { rt, rn, imm } => pack(op::LDR, rt, rn, R0, scaled(insn, imm, CAP)?),
            Insn::Adr { rd, offset } => pack(op::ADR, rd, R0, R0, scaled(insn, offset, 4)?),
            Insn::AlignUp { rd, rn, log2 } => {
                if log2 > MAX_ALIGN_LOG2 {
                    return Err(EncodeError { insn });
                }
                pack(op::ALIGN_UP, rd, rn, R0, log2 as u32)
            }
            Insn::Mov { rd, rn } => pack(op::MOV, rd, rn, R0, 0),
            Insn::Mrs { rd, sysreg } => pack(op::MRS, rd, R0, R0, sysreg.index() as u32),
            Insn::Msr { sysreg, rn } => pack(op::MSR, rn, R0, R0, sysreg.index() as u32),
            Insn::Zero { rd } => pack(op::ZERO, rd, R0, R0, 0),
            Insn::Blr { rn } => pack(op::BLR, rn, R0, R0, 0),
            Insn::Ret { rn } => pack(op::RET, rn, R0, R0, 0),
            Insn::Brs { rn, rm } => pack(op::BRS, rn, rm, R0, 0),
            Insn::LdpBlr { rt, rn } => pack(op::LDP_BLR, rt, rn, R0, 0),
            Insn::BlrMem { rn, imm } => pack(op::BLR_MEM, rn, R0, R0, scaled(insn, imm, CAP)?),
        })
    }

    /// Decode one word. `None` for an unknown opcode or operand.
    pub fn decode(word: u32) -> Option<Insn> {
        let opcode = word >> 27;
        let a = Reg((word & 31) as u8);
        let b = Reg(((word >> 5) & 31) as u8);
        let c = Reg(((word >> 10) & 31) as u8);
        let raw = (word >> 15) & ((1 << IMM_BITS) - 1);
        // Sign-extend the 12-bit immediate.
        let imm = ((raw << (32 - IMM_BITS)) as i32) >> (32 - IMM_BITS);

        Some(match opcode {
            op::UDF => Insn::Udf,
            op::ADD_IMM => Insn::AddImm { rd: a, rn: b, imm: imm * CAP },
            op::STP => Insn::Stp { rt1: a, rt2: b, rn: c, imm: imm * CAP },
            op::LDP => Insn::Ldp { rt1: a, rt2: b, rn: c, imm: imm * CAP },
            op::STR => Insn::Str { rt: a, rn: b, imm: imm * CAP },
            op::LDR => Insn::Ldr { rt: a, rn: b, imm: imm * CAP },
            op::ADR => Insn::Adr { rd: a, offset: imm * 4 },
            op::ALIGN_UP if raw <= u32::from(MAX_ALIGN_LOG2) => Insn::AlignUp { rd: a, rn: b, log2: raw as u8 },
            op::MOV => Insn::Mov { rd: a, rn: b },
            op::MRS => Insn::Mrs { rd: a, sysreg: SysReg::from_index(raw)? },
            op::MSR => Insn::Msr { sysreg: SysReg::from_index(raw)?, rn: a },
            op::ZERO => Insn::Zero { rd: a },
            op::BLR => Insn::Blr { rn: a },
            op::RET => Insn::Ret { rn: a },
            op::BRS => Insn::Brs { rn: a, rm: b },
            op::LDP_BLR => Insn::LdpBlr { rt: a, rn: b },
            op::BLR_MEM => Insn::BlrMem { rn: a, imm: imm * CAP },
            _ => return None,
        })
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Insn::Udf => write!(f, "udf #0"),
            Insn::AddImm { rd, rn, imm } if imm < 0 => write!(f, "sub {}, {}, #{}", rd, rn, -imm),
            Insn::AddImm { rd, rn, imm } => write!(f, "add {}, {}, #{}", rd, rn, imm),
            Insn::Stp { rt1, rt2, rn, imm } => write!(f, "stp {}, {}, [{}, #{}]", rt1, rt2, rn, imm),
            Insn::Ldp { rt1, rt2, rn, imm } => write!(f, "ldp {}, {}, [{}, #{}]", rt1, rt2, rn, imm),
            Insn::Str { rt, rn, imm } => write!(f, "str {}, [{}, #{}]", rt, rn, imm),
            Insn::Ldr { rt, rn, imm } => write!(f, "ldr {}, [{}, #{}]", rt, rn, imm),
            Insn::Adr { rd, offset } => write!(f, "adr {}, #{}", rd, offset),
            Insn::AlignUp { rd, rn, log2 } => write!(f, "alignu {}, {}, #{}", rd, rn, log2),
            Insn::Mov { rd, rn } => write!(f, "mov {}, {}", rd, rn),
            Insn::Mrs { rd, sysreg } => write!(f, "mrs {}, {}", rd, sysreg),
            Insn::Msr { sysreg, rn } => write!(f, "msr {}, {}", sysreg, rn),
            Insn::Zero { rd } => write!(f, "mov w{}, #0", rd.0),
            Insn::Blr { rn } => write!(f, "blr {}", rn),
            Insn::Ret { rn } => write!(f, "ret {}", rn),
            Insn::Brs { rn, rm } => write!(f, "brs c29, {}, {}", rn, rm),
            Insn::LdpBlr { rt, rn } => write!(f, "ldpblr {}, [{}]", rt, rn),
            Insn::BlrMem { rn, imm } => write!(f, "blr [{}, #{}]", rn, imm),
        }
    }
}
