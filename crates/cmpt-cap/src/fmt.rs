//! Human-readable capability rendering
//!
//! Diagnostics only. Nothing in the system makes a decision based on these
//! strings.
//!
//! ```text
//! 0000000000412000 1 [0000000000412000:0000000000416000) GrRMwWL----------- none 0 of 16384
//! ```

use alloc::format;
use alloc::string::String;
use core::fmt;

use crate::capability::{Capability, ObjectType, OTYPE_MASK};
use crate::perms::Perms;

/// One character per permission, `-` when absent.
pub fn perms_to_string(perms: Perms) -> String {
    Perms::MNEMONICS
        .iter()
        .map(|&(perm, c)| if perms.contains(perm) { c } else { '-' })
        .collect()
}

/// Seal name: `none`, `rb`, `lpb`, `lb`, or the object type in hex.
pub fn seal_to_string(otype: ObjectType) -> String {
    match otype {
        ObjectType::UNSEALED => String::from("none"),
        ObjectType::RB => String::from("rb"),
        ObjectType::LPB => String::from("lpb"),
        ObjectType::LB => String::from("lb"),
        ObjectType(t) => format!("{:04x}", t as u64 & OTYPE_MASK),
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x} {} [{:016x}:{:016x}) {} {:<4} {} of {}",
            self.address(),
            if self.is_valid() { '1' } else { '0' },
            self.base(),
            self.limit(),
            perms_to_string(self.perms()),
            seal_to_string(self.otype()),
            self.offset(),
            self.length()
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&seal_to_string(*self))
    }
}
