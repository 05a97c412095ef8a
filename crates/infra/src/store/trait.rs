use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use batchledger_core::{ExpectedVersion, LocationId, ProductId};
use batchledger_inventory::{Batch, BatchId, BatchNumber, StockKey, StockLevel, StockMovement};

/// Storage boundary error.
///
/// These are **infrastructure errors** (staleness, uniqueness, availability)
/// as opposed to domain errors (validation, invariants).
///
/// - **Concurrency**: an expectation in the change set no longer holds; the
///   caller re-reads and re-plans.
/// - **DuplicateBatchNumber**: the unique batch-number constraint rejected an insert.
/// - **Unavailable**: the backend could not be reached (or a lock was poisoned).
/// - **InvalidChange**: the change set itself is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("batch number {0} is already in use")]
    DuplicateBatchNumber(BatchNumber),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid change set: {0}")]
    InvalidChange(String),
}

/// Product as seen from the catalog: identity, display name and the
/// denormalized on-hand total this ledger maintains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: ProductId,
    pub name: String,
    pub stock_quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    Warehouse,
    Vehicle,
    Store,
    Other,
}

/// Read-only location registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub location_id: LocationId,
    pub name: String,
    pub kind: LocationKind,
}

/// Export shape of a whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub products: Vec<ProductRecord>,
    pub locations: Vec<LocationRecord>,
    pub batches: Vec<Batch>,
    /// In append order.
    pub movements: Vec<StockMovement>,
    pub stock_levels: Vec<StockLevel>,
}

/// Removal of a batch together with every ledger row written on its behalf.
///
/// Only the registry's delete path can build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeBatch {
    batch_id: BatchId,
    expected: ExpectedVersion,
}

impl PurgeBatch {
    pub(crate) fn new(batch_id: BatchId, expected: ExpectedVersion) -> Self {
        Self { batch_id, expected }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn expected(&self) -> ExpectedVersion {
        self.expected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchWrite {
    /// New batch; fails with `DuplicateBatchNumber` on a number clash.
    Insert(Batch),
    /// Replace the stored batch if it is still at `expected`.
    Update {
        batch: Batch,
        expected: ExpectedVersion,
    },
    Purge(PurgeBatch),
}

/// Set one stock level, provided it still holds `expected` (0 when absent).
///
/// A `new_quantity` of 0 deletes the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevelWrite {
    pub key: StockKey,
    pub expected: i64,
    pub new_quantity: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductTotalWrite {
    /// Fast path: add `delta` to a total still equal to `expected`.
    Increment {
        product_id: ProductId,
        expected: i64,
        delta: i64,
    },
    /// Authoritative path: sum the product's stock levels as they stand
    /// after this change set's level writes.
    Recompute(ProductId),
}

impl ProductTotalWrite {
    pub fn product_id(&self) -> ProductId {
        match self {
            ProductTotalWrite::Increment { product_id, .. } => *product_id,
            ProductTotalWrite::Recompute(product_id) => *product_id,
        }
    }
}

/// One atomic, optimistically checked unit of writes.
///
/// Either every expectation holds and every write lands, or nothing changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub batch: Option<BatchWrite>,
    pub movements: Vec<StockMovement>,
    pub levels: Vec<StockLevelWrite>,
    pub totals: Vec<ProductTotalWrite>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch(mut self, write: BatchWrite) -> Self {
        self.batch = Some(write);
        self
    }

    pub fn push_movement(&mut self, movement: StockMovement) {
        self.movements.push(movement);
    }

    pub fn push_level(&mut self, write: StockLevelWrite) {
        self.levels.push(write);
    }

    pub fn push_total(&mut self, write: ProductTotalWrite) {
        self.totals.push(write);
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_none()
            && self.movements.is_empty()
            && self.levels.is_empty()
            && self.totals.is_empty()
    }
}

/// Transactional store for batches, the movement ledger and its projections.
///
/// Reads return owned copies; a read followed by a commit is only safe
/// because `commit` re-checks every expectation the change set carries.
pub trait LedgerStore: Send + Sync {
    fn product(&self, product_id: ProductId) -> Result<Option<ProductRecord>, StoreError>;

    fn products(&self) -> Result<Vec<ProductRecord>, StoreError>;

    fn location(&self, location_id: LocationId) -> Result<Option<LocationRecord>, StoreError>;

    fn batch(&self, batch_id: BatchId) -> Result<Option<Batch>, StoreError>;

    fn batches(&self) -> Result<Vec<Batch>, StoreError>;

    /// Allocation and deallocation rows of one batch, in append order.
    fn batch_movements(&self, batch_id: BatchId) -> Result<Vec<StockMovement>, StoreError>;

    /// The whole ledger, in append order.
    fn movements(&self) -> Result<Vec<StockMovement>, StoreError>;

    fn stock_level(&self, key: StockKey) -> Result<Option<StockLevel>, StoreError>;

    /// Stored levels, optionally restricted to one product.
    fn stock_levels(&self, product_id: Option<ProductId>) -> Result<Vec<StockLevel>, StoreError>;

    /// Consistent point-in-time copy of everything.
    fn snapshot(&self) -> Result<LedgerSnapshot, StoreError>;

    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}

impl<S> LedgerStore for std::sync::Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn product(&self, product_id: ProductId) -> Result<Option<ProductRecord>, StoreError> {
        (**self).product(product_id)
    }

    fn products(&self) -> Result<Vec<ProductRecord>, StoreError> {
        (**self).products()
    }

    fn location(&self, location_id: LocationId) -> Result<Option<LocationRecord>, StoreError> {
        (**self).location(location_id)
    }

    fn batch(&self, batch_id: BatchId) -> Result<Option<Batch>, StoreError> {
        (**self).batch(batch_id)
    }

    fn batches(&self) -> Result<Vec<Batch>, StoreError> {
        (**self).batches()
    }

    fn batch_movements(&self, batch_id: BatchId) -> Result<Vec<StockMovement>, StoreError> {
        (**self).batch_movements(batch_id)
    }

    fn movements(&self) -> Result<Vec<StockMovement>, StoreError> {
        (**self).movements()
    }

    fn stock_level(&self, key: StockKey) -> Result<Option<StockLevel>, StoreError> {
        (**self).stock_level(key)
    }

    fn stock_levels(&self, product_id: Option<ProductId>) -> Result<Vec<StockLevel>, StoreError> {
        (**self).stock_levels(product_id)
    }

    fn snapshot(&self) -> Result<LedgerSnapshot, StoreError> {
        (**self).snapshot()
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        (**self).commit(changes)
    }
}
