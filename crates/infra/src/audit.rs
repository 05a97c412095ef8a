//! Audit trail sinks.
//!
//! Recording is fire-and-forget: a failing sink is logged and the business
//! operation that triggered it still succeeds.

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::warn;

use batchledger_inventory::{AuditEntry, EntityRef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

pub trait AuditTrail: Send + Sync {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

impl<T> AuditTrail for Arc<T>
where
    T: AuditTrail + ?Sized,
{
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        (**self).record(entry)
    }
}

/// Record `entry`, logging instead of failing.
pub fn record_best_effort<A: AuditTrail + ?Sized>(audit: &A, entry: AuditEntry) {
    let action = entry.action.as_str();
    let entity_id = entry.entity.id.clone();
    if let Err(err) = audit.record(entry) {
        warn!(action, entity_id = %entity_id, error = %err, "failed to record audit entry");
    }
}

/// Append-only in-memory audit log.
#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries about one entity, oldest first.
    pub fn entries_for(&self, entity: &EntityRef) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.entity.kind == entity.kind && e.entity.id == entity.id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AuditTrail for InMemoryAuditTrail {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .write()
            .map_err(|_| AuditError::Unavailable("lock poisoned".to_string()))?
            .push(entry);
        Ok(())
    }
}
