//! cmpt Capability Machine - simulated hardware for compartments
//!
//! This crate is the platform the compartment manager runs on: a small
//! capability machine with tagged memory, page protections, sealed branches
//! and a compartment identifier register. It has no HAL dependency and no
//! I/O; all of its behavior is deterministic.
//!
//! # Design Principles
//!
//! 1. **Capabilities everywhere**: every fetch, load, store and branch goes
//!    through a capability and is checked against its tag, seal, bounds and
//!    permissions
//! 2. **Faults are final**: the first fault halts the machine
//! 3. **Real code**: trampolines are encoded instructions in mapped memory,
//!    subject to W^X and instruction-cache maintenance
//!
//! # Module Organization
//!
//! - `isa` - Instructions, registers and the 32-bit encoding
//! - `asm` - Label-aware assembler producing position-independent programs
//! - `memory` - Tagged, page-mapped memory (`mmap`, `mprotect`, `munmap`)
//! - `regs` - Register file
//! - `machine` - The interpreter, host calls and platform roots
//! - `native` - Host functions callable from machine code
//! - `invariants` - Address-space invariants for tests and assertions
//! - `config` / `error` - Configuration and error types

#![no_std]
extern crate alloc;

pub mod asm;
pub mod config;
pub mod error;
pub mod invariants;
pub mod isa;
pub mod machine;
pub mod memory;
pub mod native;
pub mod regs;

pub use asm::{AsmError, Assembler, Program};
pub use config::MachineConfig;
pub use error::{Fault, MapError};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use isa::{c, EncodeError, Insn, Reg, SysReg, INSN_SIZE};
pub use machine::{
    AuxType, Machine, StepEvent, StepKind, StepObserver, HOST_CALL_SITE, HOST_RETURN, TEXT_BASE,
    TEXT_SIZE,
};
pub use memory::{Memory, Prot, RegionInfo, MAP_BASE};
pub use native::{NativeFn, NativeFrame};
pub use regs::RegisterFile;
