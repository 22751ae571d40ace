//! cmpt Axiom - audit trail for the compartment manager
//!
//! Every manager operation passes through the [`AuditGateway`], which records
//! it twice:
//!
//! - **AuditLog**: the request and its response, for auditing
//! - **Ledger**: the state mutations it caused, in order, for reconstructing
//!   which compartments exist
//!
//! # Module Organization
//!
//! - `types` - Operations, outcomes and mutations
//! - `auditlog` - Append-only request/response log
//! - `ledger` - Append-only mutation ledger
//! - `gateway` - The request → execute → response wrapper

#![no_std]
extern crate alloc;

pub mod auditlog;
pub mod gateway;
pub mod ledger;
pub mod types;

pub use auditlog::{AuditEvent, AuditEventKind, AuditLog};
pub use gateway::{AuditGateway, AuditSnapshot};
pub use ledger::{Ledger, LedgerEntry};
pub use types::{EventId, Mutation, Operation, Outcome};
