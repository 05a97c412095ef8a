//! Stock movements: the append-only ledger rows.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use batchledger_core::{DomainError, DomainResult, LocationId, MovementId, ProductId, UserId};

use crate::batch::{Batch, BatchId, BatchNumber};
use crate::stock::StockKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementDirection {
    In,
    Out,
}

impl MovementDirection {
    pub fn sign(self) -> i64 {
        match self {
            MovementDirection::In => 1,
            MovementDirection::Out => -1,
        }
    }
}

/// Why a movement happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    BatchAllocation,
    BatchDeallocation,
    Sale,
    Manual,
    Adjustment,
    Return,
}

impl ReferenceType {
    /// Reference types only the allocation engine may write.
    pub fn is_batch_bookkeeping(self) -> bool {
        matches!(
            self,
            ReferenceType::BatchAllocation | ReferenceType::BatchDeallocation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceType::BatchAllocation => "batch_allocation",
            ReferenceType::BatchDeallocation => "batch_deallocation",
            ReferenceType::Sale => "sale",
            ReferenceType::Manual => "manual",
            ReferenceType::Adjustment => "adjustment",
            ReferenceType::Return => "return",
        }
    }
}

/// What a movement points back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementReference {
    pub reference_type: ReferenceType,
    pub reference_id: Option<Uuid>,
    /// Denormalized for reporting.
    pub batch_number: Option<BatchNumber>,
    /// Set on deallocations: the allocation movement being compensated.
    pub reverses: Option<MovementId>,
}

impl MovementReference {
    pub fn batch_allocation(batch: &Batch) -> Self {
        Self {
            reference_type: ReferenceType::BatchAllocation,
            reference_id: Some(batch.id_typed().as_uuid()),
            batch_number: Some(batch.batch_number().clone()),
            reverses: None,
        }
    }

    pub fn batch_deallocation(batch: &Batch, reverses: MovementId) -> Self {
        Self {
            reference_type: ReferenceType::BatchDeallocation,
            reference_id: Some(batch.id_typed().as_uuid()),
            batch_number: Some(batch.batch_number().clone()),
            reverses: Some(reverses),
        }
    }

    pub fn external(reference_type: ReferenceType, reference_id: Option<Uuid>) -> Self {
        Self {
            reference_type,
            reference_id,
            batch_number: None,
            reverses: None,
        }
    }
}

/// Immutable ledger row recording one quantity change at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    id: MovementId,
    product_id: ProductId,
    location_id: LocationId,
    direction: MovementDirection,
    quantity: i64,
    previous_quantity: i64,
    new_quantity: i64,
    reference: MovementReference,
    occurred_at: DateTime<Utc>,
    actor: Option<UserId>,
    notes: Option<String>,
}

impl StockMovement {
    /// Build a movement from the level it was applied to.
    ///
    /// `quantity` must be positive and the resulting level non-negative.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        key: StockKey,
        direction: MovementDirection,
        quantity: i64,
        previous_quantity: i64,
        reference: MovementReference,
        occurred_at: DateTime<Utc>,
        actor: Option<UserId>,
        notes: Option<String>,
    ) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::validation(format!(
                "movement quantity must be positive (got {quantity})"
            )));
        }
        let new_quantity = previous_quantity + direction.sign() * quantity;
        if new_quantity < 0 {
            return Err(DomainError::insufficient(
                format!(
                    "stock of product {} at location {}",
                    key.product_id, key.location_id
                ),
                quantity,
                previous_quantity,
            ));
        }

        Ok(Self {
            id: MovementId::new(),
            product_id: key.product_id,
            location_id: key.location_id,
            direction,
            quantity,
            previous_quantity,
            new_quantity,
            reference,
            occurred_at,
            actor,
            notes,
        })
    }

    pub fn id(&self) -> MovementId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.location_id)
    }

    pub fn direction(&self) -> MovementDirection {
        self.direction
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn signed_quantity(&self) -> i64 {
        self.direction.sign() * self.quantity
    }

    pub fn previous_quantity(&self) -> i64 {
        self.previous_quantity
    }

    pub fn new_quantity(&self) -> i64 {
        self.new_quantity
    }

    pub fn reference(&self) -> &MovementReference {
        &self.reference
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.reference.reference_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn actor(&self) -> Option<UserId> {
        self.actor
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// True for allocation/deallocation rows written on behalf of `batch_id`.
    pub fn belongs_to_batch(&self, batch_id: BatchId) -> bool {
        self.reference.reference_type.is_batch_bookkeeping()
            && self.reference.reference_id == Some(batch_id.as_uuid())
    }
}

/// Allocation movements of a batch that no deallocation has compensated yet.
pub fn outstanding_allocations<'a>(
    batch_id: BatchId,
    movements: impl IntoIterator<Item = &'a StockMovement>,
) -> Vec<&'a StockMovement> {
    let own: Vec<&StockMovement> = movements
        .into_iter()
        .filter(|m| m.belongs_to_batch(batch_id))
        .collect();

    let compensated: HashSet<MovementId> = own
        .iter()
        .filter(|m| m.reference_type() == ReferenceType::BatchDeallocation)
        .filter_map(|m| m.reference().reverses)
        .collect();

    own.into_iter()
        .filter(|m| m.reference_type() == ReferenceType::BatchAllocation)
        .filter(|m| !compensated.contains(&m.id()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchledger_core::AggregateId;

    fn key() -> StockKey {
        StockKey::new(ProductId::new(), LocationId::new())
    }

    #[test]
    fn record_computes_snapshots() {
        let m = StockMovement::record(
            key(),
            MovementDirection::In,
            25,
            10,
            MovementReference::external(ReferenceType::Manual, None),
            Utc::now(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(m.previous_quantity(), 10);
        assert_eq!(m.new_quantity(), 35);
        assert_eq!(m.signed_quantity(), 25);
    }

    #[test]
    fn record_rejects_zero_quantity() {
        let err = StockMovement::record(
            key(),
            MovementDirection::In,
            0,
            0,
            MovementReference::external(ReferenceType::Manual, None),
            Utc::now(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn record_rejects_out_below_zero() {
        let err = StockMovement::record(
            key(),
            MovementDirection::Out,
            5,
            3,
            MovementReference::external(ReferenceType::Sale, None),
            Utc::now(),
            None,
            None,
        )
        .unwrap_err();
        match err {
            DomainError::InsufficientQuantity {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn compensated_allocations_are_not_outstanding() {
        let batch_id = BatchId::new(AggregateId::new());
        let batch_ref = |reference_type, reverses| MovementReference {
            reference_type,
            reference_id: Some(batch_id.as_uuid()),
            batch_number: None,
            reverses,
        };
        let k = key();

        let first = StockMovement::record(
            k,
            MovementDirection::In,
            10,
            0,
            batch_ref(ReferenceType::BatchAllocation, None),
            Utc::now(),
            None,
            None,
        )
        .unwrap();
        let undo = StockMovement::record(
            k,
            MovementDirection::Out,
            10,
            10,
            batch_ref(ReferenceType::BatchDeallocation, Some(first.id())),
            Utc::now(),
            None,
            None,
        )
        .unwrap();
        let second = StockMovement::record(
            k,
            MovementDirection::In,
            4,
            0,
            batch_ref(ReferenceType::BatchAllocation, None),
            Utc::now(),
            None,
            None,
        )
        .unwrap();
        let unrelated = StockMovement::record(
            k,
            MovementDirection::In,
            7,
            4,
            MovementReference::external(ReferenceType::Return, Some(batch_id.as_uuid())),
            Utc::now(),
            None,
            None,
        )
        .unwrap();

        let ledger = vec![first, undo, second.clone(), unrelated];
        let outstanding = outstanding_allocations(batch_id, &ledger);
        assert_eq!(outstanding, vec![&second]);
    }
}
