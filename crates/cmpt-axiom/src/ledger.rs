//! Mutation ledger
//!
//! Append-only record of every state change the manager made, tied to the
//! audit request that caused it. Replaying the ledger yields the set of live
//! compartments.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::types::{EventId, Mutation};

/// One ledger entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Sequence number (monotonic, never trimmed)
    pub seq: u64,
    /// Audit request that caused the mutation
    pub request: Option<EventId>,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    pub mutation: Mutation,
}

/// Append-only mutation ledger.
#[derive(Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutation. Returns its sequence number.
    pub fn append(&mut self, mutation: Mutation, request: Option<EventId>, timestamp: u64) -> u64 {
        let seq = self.entries.len() as u64;
        self.entries.push(LedgerEntry {
            seq,
            request,
            timestamp,
            mutation,
        });
        seq
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay the ledger: identity of every compartment created and not
    /// destroyed, keyed by handle address.
    pub fn live_compartments(&self) -> BTreeMap<u64, u64> {
        let mut live = BTreeMap::new();
        for entry in &self.entries {
            match entry.mutation {
                Mutation::CompartmentCreated { id, handle, .. } => {
                    live.insert(handle, id);
                }
                Mutation::CompartmentDestroyed { handle, .. } => {
                    live.remove(&handle);
                }
                _ => {}
            }
        }
        live
    }

    /// True once a halt has been recorded.
    pub fn halted(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.mutation, Mutation::Halted { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    fn created(id: u64, handle: u64) -> Mutation {
        Mutation::CompartmentCreated {
            id,
            otype: id as u16,
            handle,
            code: handle,
            data: handle + 0x2000,
            stack: handle + 0x4000,
            stack_pages: 1,
        }
    }

    #[test]
    fn test_replay_tracks_live_set() {
        let mut ledger = Ledger::new();
        ledger.append(created(4, 0x1000), Some(0), 1);
        ledger.append(created(5, 0x9000), Some(2), 2);
        ledger.append(
            Mutation::CompartmentDestroyed {
                id: 4,
                handle: 0x1000,
            },
            Some(4),
            3,
        );

        let live = ledger.live_compartments();
        assert_eq!(live.len(), 1);
        assert_eq!(live.get(&0x9000), Some(&5));
        assert_eq!(ledger.entries()[2].seq, 2);
    }

    #[test]
    fn test_halt_recorded() {
        let mut ledger = Ledger::new();
        assert!(!ledger.halted());
        ledger.append(
            Mutation::Halted {
                fault: String::from("tag violation at 0x0"),
            },
            None,
            9,
        );
        assert!(ledger.halted());
    }
}
