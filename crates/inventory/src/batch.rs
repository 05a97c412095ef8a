use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use batchledger_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, LocationId, ProductId, UserId,
};
use batchledger_events::Event;

/// Batch identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub AggregateId);

impl BatchId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        *self.0.as_uuid()
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Human-facing batch number: `B{YYYYMMDD}-{NNNN}`.
///
/// Uniqueness is not guaranteed by construction; the store rejects duplicates
/// and the registry regenerates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchNumber(String);

impl BatchNumber {
    pub fn generate(manufacturing_date: NaiveDate, suffix: u16) -> Self {
        Self(format!(
            "B{}-{:04}",
            manufacturing_date.format("%Y%m%d"),
            suffix % 10_000
        ))
    }

    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for BatchNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

/// Batch lifecycle.
///
/// `Active`/`Depleted` follow the allocation figures; `Expired` and
/// `Quarantine` are set by hand and survive unrelated patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    #[default]
    Active,
    Expired,
    Depleted,
    Quarantine,
}

/// Descriptive attributes of a batch (everything except allocation bookkeeping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAttributes {
    pub product_id: ProductId,
    pub quantity_produced: i64,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: Option<NaiveDate>,
    pub rolls: Option<i64>,
    pub weight_grams: Option<i64>,
    /// Minor currency units.
    pub cost_price: Option<i64>,
    pub quality_status: QualityStatus,
    pub initial_location: Option<LocationId>,
    pub produced_by: Option<UserId>,
    pub wastage_quantity: i64,
    /// Minor currency units.
    pub wastage_cost: i64,
    pub notes: Option<String>,
}

impl BatchAttributes {
    pub fn validate(&self) -> DomainResult<()> {
        non_negative("quantity_produced", self.quantity_produced)?;
        non_negative("wastage_quantity", self.wastage_quantity)?;
        non_negative("wastage_cost", self.wastage_cost)?;
        if let Some(rolls) = self.rolls {
            non_negative("rolls", rolls)?;
        }
        if let Some(weight) = self.weight_grams {
            non_negative("weight_grams", weight)?;
        }
        if let Some(cost) = self.cost_price {
            non_negative("cost_price", cost)?;
        }
        if let Some(expiry) = self.expiry_date {
            if expiry < self.manufacturing_date {
                return Err(DomainError::validation(format!(
                    "expiry_date {expiry} is before manufacturing_date {}",
                    self.manufacturing_date
                )));
            }
        }
        Ok(())
    }
}

fn non_negative(field: &str, value: i64) -> DomainResult<()> {
    if value < 0 {
        return Err(DomainError::validation(format!(
            "{field} cannot be negative (got {value})"
        )));
    }
    Ok(())
}

/// Partial update of a batch.
///
/// Allocation figures and the batch number are deliberately absent: the
/// former only move through allocation/reversal, the latter never changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchPatch {
    pub product_id: Option<ProductId>,
    pub quantity_produced: Option<i64>,
    pub manufacturing_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub rolls: Option<i64>,
    pub weight_grams: Option<i64>,
    pub cost_price: Option<i64>,
    pub quality_status: Option<QualityStatus>,
    pub lifecycle_status: Option<LifecycleStatus>,
    pub initial_location: Option<LocationId>,
    pub produced_by: Option<UserId>,
    pub wastage_quantity: Option<i64>,
    pub wastage_cost: Option<i64>,
    pub notes: Option<String>,
}

impl BatchPatch {
    pub fn is_empty(&self) -> bool {
        self == &BatchPatch::default()
    }

    fn apply_to(&self, attrs: &mut BatchAttributes) {
        if let Some(v) = self.product_id {
            attrs.product_id = v;
        }
        if let Some(v) = self.quantity_produced {
            attrs.quantity_produced = v;
        }
        if let Some(v) = self.manufacturing_date {
            attrs.manufacturing_date = v;
        }
        if let Some(v) = self.expiry_date {
            attrs.expiry_date = Some(v);
        }
        if let Some(v) = self.rolls {
            attrs.rolls = Some(v);
        }
        if let Some(v) = self.weight_grams {
            attrs.weight_grams = Some(v);
        }
        if let Some(v) = self.cost_price {
            attrs.cost_price = Some(v);
        }
        if let Some(v) = self.quality_status {
            attrs.quality_status = v;
        }
        if let Some(v) = self.initial_location {
            attrs.initial_location = Some(v);
        }
        if let Some(v) = self.produced_by {
            attrs.produced_by = Some(v);
        }
        if let Some(v) = self.wastage_quantity {
            attrs.wastage_quantity = v;
        }
        if let Some(v) = self.wastage_cost {
            attrs.wastage_cost = v;
        }
        if let Some(v) = &self.notes {
            attrs.notes = Some(v.clone());
        }
    }
}

/// Aggregate root: Batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    id: BatchId,
    batch_number: BatchNumber,
    attributes: BatchAttributes,
    allocated_quantity: i64,
    lifecycle_status: LifecycleStatus,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
    deleted: bool,
}

impl Batch {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: BatchId) -> Self {
        Self {
            id,
            batch_number: BatchNumber::default(),
            attributes: BatchAttributes {
                product_id: ProductId::from_uuid(Uuid::nil()),
                quantity_produced: 0,
                manufacturing_date: NaiveDate::default(),
                expiry_date: None,
                rolls: None,
                weight_grams: None,
                cost_price: None,
                quality_status: QualityStatus::Pending,
                initial_location: None,
                produced_by: None,
                wastage_quantity: 0,
                wastage_cost: 0,
                notes: None,
            },
            allocated_quantity: 0,
            lifecycle_status: LifecycleStatus::Active,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn id_typed(&self) -> BatchId {
        self.id
    }

    pub fn batch_number(&self) -> &BatchNumber {
        &self.batch_number
    }

    pub fn attributes(&self) -> &BatchAttributes {
        &self.attributes
    }

    pub fn product_id(&self) -> ProductId {
        self.attributes.product_id
    }

    pub fn quantity_produced(&self) -> i64 {
        self.attributes.quantity_produced
    }

    pub fn allocated_quantity(&self) -> i64 {
        self.allocated_quantity
    }

    /// Quantity still available for allocation.
    pub fn remaining_quantity(&self) -> i64 {
        (self.attributes.quantity_produced - self.allocated_quantity).max(0)
    }

    pub fn lifecycle_status(&self) -> LifecycleStatus {
        self.lifecycle_status
    }

    pub fn quality_status(&self) -> QualityStatus {
        self.attributes.quality_status
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// A batch with nothing produced is never considered depleted.
    pub fn is_fully_allocated(&self) -> bool {
        self.attributes.quantity_produced > 0
            && self.allocated_quantity >= self.attributes.quantity_produced
    }

    fn derived_status(&self) -> LifecycleStatus {
        if self.is_fully_allocated() {
            LifecycleStatus::Depleted
        } else {
            LifecycleStatus::Active
        }
    }

    fn describe(&self) -> String {
        format!("batch {} ({})", self.batch_number, self.id)
    }
}

impl AggregateRoot for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateBatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBatch {
    pub batch_id: BatchId,
    pub batch_number: BatchNumber,
    pub attributes: BatchAttributes,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateBatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub batch_id: BatchId,
    pub patch: BatchPatch,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AllocateStock (total of one allocation call).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateStock {
    pub batch_id: BatchId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReverseAllocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseAllocations {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteBatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBatch {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchCommand {
    CreateBatch(CreateBatch),
    UpdateBatch(UpdateBatch),
    AllocateStock(AllocateStock),
    ReverseAllocations(ReverseAllocations),
    DeleteBatch(DeleteBatch),
}

/// Event: BatchCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreated {
    pub batch_id: BatchId,
    pub batch_number: BatchNumber,
    pub attributes: BatchAttributes,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdated {
    pub batch_id: BatchId,
    pub patch: BatchPatch,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAllocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAllocated {
    pub batch_id: BatchId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationsReversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationsReversed {
    pub batch_id: BatchId,
    /// Allocated quantity released back to the batch.
    pub released: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleted {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEvent {
    BatchCreated(BatchCreated),
    BatchUpdated(BatchUpdated),
    StockAllocated(StockAllocated),
    AllocationsReversed(AllocationsReversed),
    BatchDeleted(BatchDeleted),
}

impl Event for BatchEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::BatchCreated(_) => "inventory.batch.created",
            BatchEvent::BatchUpdated(_) => "inventory.batch.updated",
            BatchEvent::StockAllocated(_) => "inventory.batch.allocated",
            BatchEvent::AllocationsReversed(_) => "inventory.batch.allocations_reversed",
            BatchEvent::BatchDeleted(_) => "inventory.batch.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BatchEvent::BatchCreated(e) => e.occurred_at,
            BatchEvent::BatchUpdated(e) => e.occurred_at,
            BatchEvent::StockAllocated(e) => e.occurred_at,
            BatchEvent::AllocationsReversed(e) => e.occurred_at,
            BatchEvent::BatchDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Batch {
    type Command = BatchCommand;
    type Event = BatchEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BatchEvent::BatchCreated(e) => {
                self.id = e.batch_id;
                self.batch_number = e.batch_number.clone();
                self.attributes = e.attributes.clone();
                self.allocated_quantity = 0;
                self.lifecycle_status = LifecycleStatus::Active;
                self.created_at = Some(e.occurred_at);
                self.updated_at = Some(e.occurred_at);
                self.created = true;
            }
            BatchEvent::BatchUpdated(e) => {
                e.patch.apply_to(&mut self.attributes);
                let requested = e.patch.lifecycle_status.unwrap_or(self.lifecycle_status);
                self.lifecycle_status = match requested {
                    LifecycleStatus::Active | LifecycleStatus::Depleted => self.derived_status(),
                    manual => manual,
                };
                self.updated_at = Some(e.occurred_at);
            }
            BatchEvent::StockAllocated(e) => {
                self.allocated_quantity += e.quantity;
                if self.is_fully_allocated() {
                    self.lifecycle_status = LifecycleStatus::Depleted;
                }
                self.updated_at = Some(e.occurred_at);
            }
            BatchEvent::AllocationsReversed(e) => {
                self.allocated_quantity = 0;
                self.lifecycle_status = LifecycleStatus::Active;
                self.updated_at = Some(e.occurred_at);
            }
            BatchEvent::BatchDeleted(e) => {
                self.deleted = true;
                self.updated_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BatchCommand::CreateBatch(cmd) => self.handle_create(cmd),
            BatchCommand::UpdateBatch(cmd) => self.handle_update(cmd),
            BatchCommand::AllocateStock(cmd) => self.handle_allocate(cmd),
            BatchCommand::ReverseAllocations(cmd) => self.handle_reverse(cmd),
            BatchCommand::DeleteBatch(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Batch {
    fn ensure_live(&self, batch_id: BatchId) -> Result<(), DomainError> {
        if !self.created || self.deleted {
            return Err(DomainError::not_found(format!("batch {batch_id}")));
        }
        if self.id != batch_id {
            return Err(DomainError::invariant("batch_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateBatch) -> Result<Vec<BatchEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!(
                "batch {} already exists",
                cmd.batch_id
            )));
        }
        if cmd.batch_number.as_str().trim().is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }
        cmd.attributes.validate()?;

        Ok(vec![BatchEvent::BatchCreated(BatchCreated {
            batch_id: cmd.batch_id,
            batch_number: cmd.batch_number.clone(),
            attributes: cmd.attributes.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateBatch) -> Result<Vec<BatchEvent>, DomainError> {
        self.ensure_live(cmd.batch_id)?;

        let patch = &cmd.patch;
        if patch.is_empty() {
            return Err(DomainError::validation(format!(
                "update for {} changes nothing",
                self.describe()
            )));
        }
        if patch.lifecycle_status == Some(LifecycleStatus::Depleted) {
            return Err(DomainError::validation(
                "lifecycle status 'depleted' is derived from allocations and cannot be set directly",
            ));
        }
        if let Some(product_id) = patch.product_id {
            if product_id != self.attributes.product_id && self.allocated_quantity > 0 {
                return Err(DomainError::invariant(format!(
                    "cannot move {} to product {product_id} while {} units are allocated",
                    self.describe(),
                    self.allocated_quantity
                )));
            }
        }

        let mut merged = self.attributes.clone();
        patch.apply_to(&mut merged);
        merged.validate()?;
        if merged.quantity_produced < self.allocated_quantity {
            return Err(DomainError::invariant(format!(
                "quantity_produced {} for {} would fall below allocated quantity {}",
                merged.quantity_produced,
                self.describe(),
                self.allocated_quantity
            )));
        }

        Ok(vec![BatchEvent::BatchUpdated(BatchUpdated {
            batch_id: cmd.batch_id,
            patch: patch.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_allocate(&self, cmd: &AllocateStock) -> Result<Vec<BatchEvent>, DomainError> {
        self.ensure_live(cmd.batch_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "allocation quantity for {} must be positive (got {})",
                self.describe(),
                cmd.quantity
            )));
        }

        let remaining = self.remaining_quantity();
        if cmd.quantity > remaining {
            return Err(DomainError::insufficient(
                format!("batch {}", self.batch_number),
                cmd.quantity,
                remaining,
            ));
        }

        Ok(vec![BatchEvent::StockAllocated(StockAllocated {
            batch_id: cmd.batch_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reverse(&self, cmd: &ReverseAllocations) -> Result<Vec<BatchEvent>, DomainError> {
        self.ensure_live(cmd.batch_id)?;

        // Nothing allocated: reversal is a no-op.
        if self.allocated_quantity == 0 {
            return Ok(vec![]);
        }

        Ok(vec![BatchEvent::AllocationsReversed(AllocationsReversed {
            batch_id: cmd.batch_id,
            released: self.allocated_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteBatch) -> Result<Vec<BatchEvent>, DomainError> {
        self.ensure_live(cmd.batch_id)?;

        if self.allocated_quantity != 0 {
            return Err(DomainError::invariant(format!(
                "{} still has {} allocated units; reverse before deleting",
                self.describe(),
                self.allocated_quantity
            )));
        }

        Ok(vec![BatchEvent::BatchDeleted(BatchDeleted {
            batch_id: cmd.batch_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_batch_id() -> BatchId {
        BatchId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_attributes(quantity_produced: i64) -> BatchAttributes {
        BatchAttributes {
            product_id: ProductId::new(),
            quantity_produced,
            manufacturing_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            expiry_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            rolls: Some(4),
            weight_grams: Some(12_500),
            cost_price: Some(1_999),
            quality_status: QualityStatus::Passed,
            initial_location: None,
            produced_by: None,
            wastage_quantity: 0,
            wastage_cost: 0,
            notes: None,
        }
    }

    fn created_batch(quantity_produced: i64) -> Batch {
        let batch_id = test_batch_id();
        let mut batch = Batch::empty(batch_id);
        let events = batch
            .handle(&BatchCommand::CreateBatch(CreateBatch {
                batch_id,
                batch_number: BatchNumber::parse("B20240301-0042").unwrap(),
                attributes: test_attributes(quantity_produced),
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            batch.apply(e);
        }
        batch
    }

    fn allocate(batch: &mut Batch, quantity: i64) -> Result<(), DomainError> {
        let events = batch.handle(&BatchCommand::AllocateStock(AllocateStock {
            batch_id: batch.id_typed(),
            quantity,
            occurred_at: test_time(),
        }))?;
        for e in &events {
            batch.apply(e);
        }
        Ok(())
    }

    fn patch(batch: &mut Batch, patch: BatchPatch) -> Result<(), DomainError> {
        let events = batch.handle(&BatchCommand::UpdateBatch(UpdateBatch {
            batch_id: batch.id_typed(),
            patch,
            occurred_at: test_time(),
        }))?;
        for e in &events {
            batch.apply(e);
        }
        Ok(())
    }

    #[test]
    fn batch_number_uses_date_and_padded_suffix() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        assert_eq!(BatchNumber::generate(date, 7).as_str(), "B20240109-0007");
        assert_eq!(BatchNumber::generate(date, 12_345).as_str(), "B20240109-2345");
    }

    #[test]
    fn create_batch_starts_active_with_nothing_allocated() {
        let batch = created_batch(100);
        assert!(batch.is_created());
        assert_eq!(batch.allocated_quantity(), 0);
        assert_eq!(batch.remaining_quantity(), 100);
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Active);
        assert_eq!(batch.version(), 1);
    }

    #[test]
    fn create_rejects_negative_quantity() {
        let batch_id = test_batch_id();
        let err = Batch::empty(batch_id)
            .handle(&BatchCommand::CreateBatch(CreateBatch {
                batch_id,
                batch_number: BatchNumber::parse("B1").unwrap(),
                attributes: test_attributes(-1),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_rejects_expiry_before_manufacture() {
        let batch_id = test_batch_id();
        let mut attributes = test_attributes(10);
        attributes.expiry_date = NaiveDate::from_ymd_opt(2024, 2, 1);
        let err = Batch::empty(batch_id)
            .handle(&BatchCommand::CreateBatch(CreateBatch {
                batch_id,
                batch_number: BatchNumber::parse("B1").unwrap(),
                attributes,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn full_allocation_flips_to_depleted() {
        let mut batch = created_batch(100);
        allocate(&mut batch, 60).unwrap();
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Active);

        allocate(&mut batch, 40).unwrap();
        assert_eq!(batch.allocated_quantity(), 100);
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Depleted);
    }

    #[test]
    fn over_allocation_reports_shortfall() {
        let mut batch = created_batch(100);
        allocate(&mut batch, 100).unwrap();

        let err = allocate(&mut batch, 10).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientQuantity {
                subject: "batch B20240301-0042".to_string(),
                requested: 10,
                available: 0,
            }
        );
        assert_eq!(batch.allocated_quantity(), 100);
    }

    #[test]
    fn reversal_resets_allocation_and_status() {
        let mut batch = created_batch(50);
        allocate(&mut batch, 50).unwrap();

        let events = batch
            .handle(&BatchCommand::ReverseAllocations(ReverseAllocations {
                batch_id: batch.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            BatchEvent::AllocationsReversed(e) => assert_eq!(e.released, 50),
            other => panic!("Expected AllocationsReversed event, got {other:?}"),
        }
        batch.apply(&events[0]);

        assert_eq!(batch.allocated_quantity(), 0);
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Active);
    }

    #[test]
    fn reversing_unallocated_batch_emits_nothing() {
        let batch = created_batch(50);
        let events = batch
            .handle(&BatchCommand::ReverseAllocations(ReverseAllocations {
                batch_id: batch.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn patch_cannot_shrink_below_allocated() {
        let mut batch = created_batch(100);
        allocate(&mut batch, 70).unwrap();

        let err = patch(
            &mut batch,
            BatchPatch {
                quantity_produced: Some(60),
                ..BatchPatch::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn patch_shrinking_to_allocated_depletes() {
        let mut batch = created_batch(100);
        allocate(&mut batch, 70).unwrap();

        patch(
            &mut batch,
            BatchPatch {
                quantity_produced: Some(70),
                ..BatchPatch::default()
            },
        )
        .unwrap();
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Depleted);
    }

    #[test]
    fn manual_statuses_survive_unrelated_patches() {
        let mut batch = created_batch(100);
        patch(
            &mut batch,
            BatchPatch {
                lifecycle_status: Some(LifecycleStatus::Quarantine),
                ..BatchPatch::default()
            },
        )
        .unwrap();
        patch(
            &mut batch,
            BatchPatch {
                notes: Some("moved to cold room".to_string()),
                ..BatchPatch::default()
            },
        )
        .unwrap();
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Quarantine);
    }

    #[test]
    fn depleted_cannot_be_set_by_hand() {
        let mut batch = created_batch(100);
        let err = patch(
            &mut batch,
            BatchPatch {
                lifecycle_status: Some(LifecycleStatus::Depleted),
                ..BatchPatch::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn product_change_requires_no_allocations() {
        let mut batch = created_batch(100);
        allocate(&mut batch, 1).unwrap();
        let err = patch(
            &mut batch,
            BatchPatch {
                product_id: Some(ProductId::new()),
                ..BatchPatch::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn delete_requires_reversal_first() {
        let mut batch = created_batch(10);
        allocate(&mut batch, 5).unwrap();
        let err = batch
            .handle(&BatchCommand::DeleteBatch(DeleteBatch {
                batch_id: batch.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn deleted_batch_rejects_further_commands() {
        let mut batch = created_batch(10);
        let events = batch
            .handle(&BatchCommand::DeleteBatch(DeleteBatch {
                batch_id: batch.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap();
        batch.apply(&events[0]);

        let err = allocate(&mut batch, 1).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: no sequence of allocation attempts pushes allocated past produced.
            #[test]
            fn allocation_never_exceeds_produced(
                produced in 0i64..500,
                requests in proptest::collection::vec(-20i64..120, 0..30)
            ) {
                let mut batch = created_batch(produced);
                for q in requests {
                    let _ = allocate(&mut batch, q);
                    prop_assert!(batch.allocated_quantity() >= 0);
                    prop_assert!(batch.allocated_quantity() <= batch.quantity_produced());
                    prop_assert_eq!(
                        batch.lifecycle_status() == LifecycleStatus::Depleted,
                        batch.is_fully_allocated()
                    );
                }
            }

            /// Property: handle() never mutates state.
            #[test]
            fn handle_is_pure(quantity in 1i64..100) {
                let batch = created_batch(100);
                let before = batch.clone();
                let cmd = BatchCommand::AllocateStock(AllocateStock {
                    batch_id: batch.id_typed(),
                    quantity,
                    occurred_at: test_time(),
                });
                let first = batch.handle(&cmd);
                let second = batch.handle(&cmd);
                prop_assert_eq!(&before, &batch);
                prop_assert_eq!(first, second);
            }
        }
    }
}
