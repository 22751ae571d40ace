//! A tiny label-aware assembler
//!
//! Programs are position independent: the only label references are
//! PC-relative `adr`s, resolved when the program is finished. The result can
//! be copied to any instruction-aligned address and run there.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use crate::isa::{EncodeError, Insn, Reg, INSN_SIZE};

/// Assembly failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsmError {
    /// The same label was defined twice
    DuplicateLabel(&'static str),
    /// An `adr` names a label that was never defined
    UndefinedLabel(&'static str),
    /// An instruction could not be encoded
    Encode(EncodeError),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::DuplicateLabel(l) => write!(f, "label `{}` defined twice", l),
            AsmError::UndefinedLabel(l) => write!(f, "label `{}` is not defined", l),
            AsmError::Encode(e) => write!(f, "{}", e),
        }
    }
}

impl From<EncodeError> for AsmError {
    fn from(e: EncodeError) -> Self {
        AsmError::Encode(e)
    }
}

enum Item {
    Insn(Insn),
    Adr { rd: Reg, label: &'static str },
}

/// Builds a [`Program`] one instruction at a time.
#[derive(Default)]
pub struct Assembler {
    items: Vec<Item>,
    labels: BTreeMap<&'static str, usize>,
    duplicate: Option<&'static str>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `name` at the current position.
    pub fn label(&mut self, name: &'static str) -> &mut Self {
        if self.labels.insert(name, self.items.len()).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name);
        }
        self
    }

    /// Append one instruction.
    pub fn emit(&mut self, insn: Insn) -> &mut Self {
        self.items.push(Item::Insn(insn));
        self
    }

    /// Append several instructions.
    pub fn emit_all(&mut self, insns: impl IntoIterator<Item = Insn>) -> &mut Self {
        for insn in insns {
            self.emit(insn);
        }
        self
    }

    /// Append `adr rd, label`.
    pub fn adr(&mut self, rd: Reg, label: &'static str) -> &mut Self {
        self.items.push(Item::Adr { rd, label });
        self
    }

    /// Resolve labels and encode.
    pub fn finish(&self) -> Result<Program, AsmError> {
        if let Some(name) = self.duplicate {
            return Err(AsmError::DuplicateLabel(name));
        }
        let mut words = Vec::with_capacity(self.items.len());
        for (index, item) in self.items.iter().enumerate() {
            let insn = match *item {
                Item::Insn(insn) => insn,
                Item::Adr { rd, label } => {
                    let target = *self.labels.get(label).ok_or(AsmError::UndefinedLabel(label))?;
                    let offset = (target as i64 - index as i64) * INSN_SIZE as i64;
                    Insn::Adr {
                        rd,
                        offset: offset as i32,
                    }
                }
            };
            words.push(insn.encode()?);
        }
        let labels = self
            .labels
            .iter()
            .map(|(name, index)| (*name, *index as u64 * INSN_SIZE))
            .collect();
        Ok(Program { words, labels })
    }
}

/// Encoded, position-independent machine code with its label offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    words: Vec<u32>,
    labels: BTreeMap<&'static str, u64>,
}

impl Program {
    /// Encoded instruction words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Size in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.words.len() as u64 * INSN_SIZE
    }

    /// Byte offset of `name` from the start of the program.
    pub fn label(&self, name: &str) -> Option<u64> {
        self.labels.get(name).copied()
    }

    /// Little-endian image, ready to copy into memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Decoded instruction at a byte offset.
    pub fn insn_at(&self, offset: u64) -> Option<Insn> {
        if offset % INSN_SIZE != 0 {
            return None;
        }
        let word = *self.words.get((offset / INSN_SIZE) as usize)?;
        Insn::decode(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::c;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut asm = Assembler::new();
        asm.label("top")
            .adr(c(1), "end")
            .emit(Insn::Zero { rd: c(2) })
            .adr(c(3), "top")
            .label("end");
        let program = asm.finish().unwrap();

        assert_eq!(program.len_bytes(), 12);
        assert_eq!(program.label("end"), Some(12));
        assert_eq!(program.insn_at(0), Some(Insn::Adr { rd: c(1), offset: 12 }));
        assert_eq!(program.insn_at(8), Some(Insn::Adr { rd: c(3), offset: -8 }));
        assert_eq!(program.to_bytes().len(), 12);
    }

    #[test]
    fn test_label_errors() {
        let mut asm = Assembler::new();
        asm.adr(c(1), "missing");
        assert_eq!(asm.finish(), Err(AsmError::UndefinedLabel("missing")));

        let mut asm = Assembler::new();
        asm.label("a").label("a");
        assert_eq!(asm.finish(), Err(AsmError::DuplicateLabel("a")));
    }
}
