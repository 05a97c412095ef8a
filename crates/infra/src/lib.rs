//! Infrastructure layer: store boundary, ledger services, reconciliation, config.
//!
//! All stock-affecting mutations enter through [`BatchLedger`]; the pure
//! business rules live in `batchledger-inventory`.

pub mod allocation;
pub mod audit;
pub mod command_dispatcher;
pub mod config;
pub mod error;
pub mod ledger;
pub mod movements;
pub mod projections;
pub mod reconciliation;
pub mod registry;
pub mod reversal;
pub mod store;

pub use allocation::{AllocationEngine, AllocationOutcome, BulkAction, BulkItem, BulkOutcome, BulkReport};
pub use audit::{AuditError, AuditTrail, InMemoryAuditTrail};
pub use command_dispatcher::{BATCH_AGGREGATE_TYPE, BatchEnvelope};
pub use config::{LedgerConfig, MIN_RECONCILIATION_INTERVAL, RetryPolicy};
pub use error::{LedgerError, LedgerResult};
pub use ledger::BatchLedger;
pub use movements::{StockMovementRequest, StockMovementService};
pub use projections::{ProductAggregator, StockLevelProjector};
pub use reconciliation::{
    DriftAlert, DriftAlertSink, InMemoryDriftAlertSink, LevelDrift, LoggingDriftAlertSink,
    ReconciliationReport, ReconciliationRunner, ReconciliationRunnerHandle, Reconciler, TotalDrift,
};
pub use registry::{BatchNumberGenerator, BatchRegistry, DeletedBatch, RandomBatchNumbers};
pub use reversal::ReversalOutcome;
pub use store::{InMemoryLedgerStore, LedgerSnapshot, LedgerStore, LocationKind, StoreError};
