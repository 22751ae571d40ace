//! Audit Log
//!
//! Records every manager operation (request + response) for the audit
//! trail. The ledger is separate: the audit log says what was asked and how
//! it ended, the ledger says what changed.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::types::{EventId, Operation, Outcome};

/// An operation request or response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    pub kind: AuditEventKind,
}

/// Type of audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditEventKind {
    Request { operation: Operation },
    Response { request_id: EventId, outcome: Outcome },
}

/// Maximum number of events to keep in memory
const MAX_AUDIT_EVENTS: usize = 10000;

/// Append-only operation log with monotonic IDs.
pub struct AuditLog {
    events: Vec<AuditEvent>,
    next_id: EventId,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
        }
    }

    /// Log a request. Returns the event ID for correlating the response.
    pub fn log_request(&mut self, operation: Operation, timestamp: u64) -> EventId {
        self.push(timestamp, AuditEventKind::Request { operation })
    }

    /// Log the response to `request_id`.
    pub fn log_response(&mut self, request_id: EventId, outcome: Outcome, timestamp: u64) {
        self.push(timestamp, AuditEventKind::Response { request_id, outcome });
    }

    fn push(&mut self, timestamp: u64, kind: AuditEventKind) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(AuditEvent {
            id,
            timestamp,
            kind,
        });
        self.trim_if_needed();
        id
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Get the most recent N events, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<&AuditEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Response recorded for `request_id`, if any.
    pub fn outcome_of(&self, request_id: EventId) -> Option<&Outcome> {
        self.events.iter().find_map(|e| match &e.kind {
            AuditEventKind::Response {
                request_id: id,
                outcome,
            } if *id == request_id => Some(outcome),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    fn trim_if_needed(&mut self) {
        if self.events.len() > MAX_AUDIT_EVENTS {
            let drain_count = self.events.len() - MAX_AUDIT_EVENTS;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
