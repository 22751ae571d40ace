//! Machine invariants
//!
//! Runtime-checkable properties of the address space that must hold between
//! any two operations:
//!
//! 1. **W^X**: no page is writable and executable
//! 2. **Maximum protection**: no page exceeds its mapping's maximum protection
//! 3. **Disjoint mappings**: regions never overlap
//! 4. **Memory limit**: mapped pages never exceed the configured limit
//! 5. **No address reuse**: every mapping lies below the allocation cursor

use alloc::string::String;
use alloc::vec::Vec;

use crate::machine::Machine;
use crate::memory::{Prot, MAP_BASE};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all machine invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(machine: &Machine) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let memory = machine.memory();
    let regions = memory.regions();

    let mut previous_end = 0u64;
    for region in &regions {
        for (i, prot) in region.page_prot.iter().enumerate() {
            let page = region.base + i as u64 * memory.page_size();
            if prot.contains(Prot::WRITE | Prot::EXEC) {
                violations.push(InvariantViolation {
                    invariant: "w_xor_x",
                    description: alloc::format!("page {:#x} is writable and executable", page),
                });
            }
            if !(region.max_prot & Prot::RWX).contains(*prot) {
                violations.push(InvariantViolation {
                    invariant: "max_prot",
                    description: alloc::format!(
                        "page {:#x} has {:?} beyond maximum {:?}",
                        page,
                        prot,
                        region.max_prot
                    ),
                });
            }
        }

        if region.base < previous_end {
            violations.push(InvariantViolation {
                invariant: "disjoint_mappings",
                description: alloc::format!("region {:#x} overlaps its predecessor", region.base),
            });
        }
        previous_end = region.base + region.len;

        if region.base >= MAP_BASE && previous_end > memory.next_base() {
            violations.push(InvariantViolation {
                invariant: "no_address_reuse",
                description: alloc::format!(
                    "region {:#x} ends above the allocation cursor {:#x}",
                    region.base,
                    memory.next_base()
                ),
            });
        }
    }

    if memory.mapped_pages() > memory.limit_pages() {
        violations.push(InvariantViolation {
            invariant: "memory_limit",
            description: alloc::format!(
                "{} pages mapped, limit {}",
                memory.mapped_pages(),
                memory.limit_pages()
            ),
        });
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    #[test]
    fn test_fresh_machine_is_clean() {
        let machine = Machine::new(MachineConfig::default()).unwrap();
        assert!(check_all_invariants(&machine).is_empty());
    }

    #[test]
    fn test_mapping_churn_keeps_invariants() {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        let code = machine.mmap(4096, Prot::RW, Prot::RWX).unwrap();
        let data = machine.mmap(8192, Prot::RW, Prot::empty()).unwrap();
        machine.mprotect(&code, code.base(), 4096, Prot::RX).unwrap();
        machine.munmap(&data, data.base(), data.length()).unwrap();
        assert!(check_all_invariants(&machine).is_empty());
    }
}
