//! Batch & stock ledger domain (pure).
//!
//! Business rules for production batches, stock movements and the projections
//! derived from them, implemented as domain logic with no IO and no storage.

pub mod audit;
pub mod batch;
pub mod movement;
pub mod request;
pub mod stock;

pub use audit::{AuditAction, AuditEntry, EntityKind, EntityRef};
pub use batch::{
    AllocateStock, AllocationsReversed, Batch, BatchAttributes, BatchCommand, BatchCreated,
    BatchDeleted, BatchEvent, BatchId, BatchNumber, BatchPatch, BatchUpdated, CreateBatch,
    DeleteBatch, LifecycleStatus, QualityStatus, ReverseAllocations, StockAllocated, UpdateBatch,
};
pub use movement::{
    MovementDirection, MovementReference, ReferenceType, StockMovement, outstanding_allocations,
};
pub use request::{AllocationLine, AllocationPlan, BatchSource, NewBatch};
pub use stock::{StockKey, StockLevel, derive_levels, product_totals};
