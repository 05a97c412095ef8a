//! Service-level errors returned by the ledger components.

use thiserror::Error;

use batchledger_core::{DomainError, LocationId, ProductId};
use batchledger_inventory::{BatchId, BatchNumber};

use crate::store::StoreError;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(
        "batch {batch_number} ({batch_id}) has {remaining} unallocated, {requested} requested (short by {})",
        .requested - .remaining
    )]
    InsufficientBatchQuantity {
        batch_id: BatchId,
        batch_number: BatchNumber,
        requested: i64,
        remaining: i64,
    },

    #[error(
        "insufficient stock of product {product_id} at location {location_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        location_id: LocationId,
        requested: i64,
        available: i64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Optimistic retries exhausted.
    #[error("{operation} on {subject} kept conflicting after {attempts} attempts")]
    ConcurrencyConflict {
        operation: &'static str,
        subject: String,
        attempts: u32,
    },

    #[error("bulk {action}: {} of {total} batches failed", .failures.len())]
    PartialBulkFailure {
        action: &'static str,
        total: usize,
        succeeded: usize,
        failures: Vec<(BatchId, LedgerError)>,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Units missing for an insufficient-quantity failure.
    pub fn shortfall(&self) -> Option<i64> {
        match self {
            LedgerError::InsufficientBatchQuantity {
                requested,
                remaining,
                ..
            } => Some(requested - remaining),
            LedgerError::InsufficientStock {
                requested,
                available,
                ..
            } => Some(requested - available),
            _ => None,
        }
    }

    /// True when re-reading and re-planning may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Store(StoreError::Concurrency(_)))
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::InvariantViolation(msg),
            DomainError::NotFound(what) => LedgerError::NotFound {
                entity: "resource",
                id: what,
            },
            // A conflict decided by the aggregate means the snapshot it saw is stale.
            DomainError::Conflict(msg) => LedgerError::Store(StoreError::Concurrency(msg)),
            DomainError::InsufficientQuantity {
                subject,
                requested,
                available,
            } => LedgerError::InvariantViolation(format!(
                "insufficient quantity in {subject}: requested {requested}, available {available}"
            )),
        }
    }
}
