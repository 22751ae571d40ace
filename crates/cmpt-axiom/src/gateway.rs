//! Audit Gateway
//!
//! Entry point for every manager operation. The gateway:
//! 1. Logs the request to the AuditLog
//! 2. Executes the operation
//! 3. Appends the resulting mutations to the Ledger
//! 4. Logs the response to the AuditLog

use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;
use serde::Serialize;

use crate::auditlog::{AuditEvent, AuditLog};
use crate::ledger::{Ledger, LedgerEntry};
use crate::types::{Mutation, Operation, Outcome};

/// Audit gateway: all manager operations flow through it.
#[derive(Default)]
pub struct AuditGateway {
    log: AuditLog,
    ledger: Ledger,
}

impl AuditGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one operation through the audit trail.
    ///
    /// `op_fn` returns the operation result and the mutations it performed.
    /// Mutations are recorded even when the result is an error, since a
    /// failed operation may still have changed state (a halt, for one).
    pub fn operation<T, E, F>(&mut self, operation: Operation, timestamp: u64, op_fn: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnOnce() -> (Result<T, E>, Vec<Mutation>),
    {
        // 1. Log request
        let request_id = self.log.log_request(operation, timestamp);

        // 2. Execute
        let (result, mutations) = op_fn();

        // 3. Record mutations
        for mutation in mutations {
            self.ledger.append(mutation, Some(request_id), timestamp);
        }

        // 4. Log response
        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(e) => Outcome::Err {
                error: e.to_string(),
            },
        };
        self.log.log_response(request_id, outcome, timestamp);

        result
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Copy of both logs for export.
    pub fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            events: self.log.events().to_vec(),
            ledger: self.ledger.entries().to_vec(),
        }
    }
}

/// Serializable copy of the audit trail.
#[derive(Clone, Debug, Serialize)]
pub struct AuditSnapshot {
    pub events: Vec<AuditEvent>,
    pub ledger: Vec<LedgerEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn test_gateway_operation_no_mutations() {
        let mut gateway = AuditGateway::new();
        let result: Result<u64, String> =
            gateway.operation(Operation::Invoke { handle: 0x10 }, 1000, || (Ok(5), Vec::new()));

        assert_eq!(result, Ok(5));
        assert_eq!(gateway.log().len(), 2);
        assert!(gateway.ledger().is_empty());
        assert_eq!(gateway.log().outcome_of(0), Some(&Outcome::Ok));
    }

    #[test]
    fn test_gateway_records_mutations_on_error() {
        let mut gateway = AuditGateway::new();
        let result: Result<(), String> = gateway.operation(Operation::Invoke { handle: 0x10 }, 7, || {
            (
                Err(String::from("tag violation")),
                alloc::vec![Mutation::Halted {
                    fault: String::from("tag violation"),
                }],
            )
        });

        assert!(result.is_err());
        assert!(gateway.ledger().halted());
        assert_eq!(gateway.ledger().entries()[0].request, Some(0));
        assert_eq!(
            gateway.log().outcome_of(0),
            Some(&Outcome::Err {
                error: String::from("tag violation")
            })
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut gateway = AuditGateway::new();
        let _: Result<(), String> =
            gateway.operation(Operation::Init { seed: 1 }, 0, || (Ok(()), Vec::new()));
        let json = serde_json::to_string(&gateway.snapshot()).unwrap();
        assert!(json.contains("\"Init\""));
        assert!(json.contains("\"seed\":1"));
    }
}
