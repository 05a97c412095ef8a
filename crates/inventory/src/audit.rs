//! Audit entries: human-readable record of mutating actions.
//!
//! Audit is best-effort and outside the consistency contract; the movement
//! ledger is the authoritative record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use batchledger_core::{AuditEntryId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BatchCreated,
    BatchUpdated,
    BatchDeleted,
    BatchAllocated,
    BatchAllocationReversed,
    StockMovementRecorded,
    StockReconciled,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::BatchCreated => "batch_created",
            AuditAction::BatchUpdated => "batch_updated",
            AuditAction::BatchDeleted => "batch_deleted",
            AuditAction::BatchAllocated => "batch_allocated",
            AuditAction::BatchAllocationReversed => "batch_allocation_reversed",
            AuditAction::StockMovementRecorded => "stock_movement_recorded",
            AuditAction::StockReconciled => "stock_reconciled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Batch,
    StockLevel,
    Ledger,
}

/// The entity an audit entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
    /// Display label, e.g. the batch number.
    pub label: Option<String>,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub action: AuditAction,
    pub entity: EntityRef,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub actor: Option<UserId>,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, entity: EntityRef, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: AuditEntryId::new(),
            action,
            entity,
            before: None,
            after: None,
            actor: None,
            notes: None,
            recorded_at,
        }
    }

    /// Snapshot serialization failures leave the snapshot empty rather than
    /// failing the entry.
    pub fn with_before<T: Serialize>(mut self, snapshot: &T) -> Self {
        self.before = serde_json::to_value(snapshot).ok();
        self
    }

    pub fn with_after<T: Serialize>(mut self, snapshot: &T) -> Self {
        self.after = serde_json::to_value(snapshot).ok();
        self
    }

    pub fn with_actor(mut self, actor: Option<UserId>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}
