//! Non-batch stock movements: sales, manual corrections, adjustments, returns.
//!
//! Every change to a stock level or product total outside the allocation
//! engine goes through [`StockMovementService::record_stock_movement`], so the
//! ledger row and both projections always move together.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use batchledger_core::{LocationId, ProductId, UserId};
use batchledger_events::EventBus;
use batchledger_inventory::{
    AuditAction, AuditEntry, EntityKind, EntityRef, MovementDirection, MovementReference,
    ReferenceType, StockKey, StockMovement,
};

use crate::audit::AuditTrail;
use crate::command_dispatcher::{BatchEnvelope, with_retry};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::BatchLedger;
use crate::store::{ChangeSet, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovementRequest {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub direction: MovementDirection,
    pub quantity: i64,
    pub reference_type: ReferenceType,
    #[serde(default)]
    pub reference_id: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl StockMovementRequest {
    pub fn new(
        product_id: ProductId,
        location_id: LocationId,
        direction: MovementDirection,
        quantity: i64,
        reference_type: ReferenceType,
    ) -> Self {
        Self {
            product_id,
            location_id,
            direction,
            quantity,
            reference_type,
            reference_id: None,
            notes: None,
        }
    }

    pub fn with_reference(mut self, reference_id: Uuid) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

pub struct StockMovementService<'a, S, A, B> {
    ledger: &'a BatchLedger<S, A, B>,
}

impl<'a, S, A, B> StockMovementService<'a, S, A, B>
where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    pub(crate) fn new(ledger: &'a BatchLedger<S, A, B>) -> Self {
        Self { ledger }
    }

    /// Append one movement and apply it to the level and product total.
    pub fn record_stock_movement(
        &self,
        request: StockMovementRequest,
        actor: Option<UserId>,
    ) -> LedgerResult<StockMovement> {
        if request.reference_type.is_batch_bookkeeping() {
            return Err(LedgerError::Validation(format!(
                "{} movements are written by the allocation engine only",
                request.reference_type.as_str()
            )));
        }
        if request.quantity <= 0 {
            return Err(LedgerError::Validation(format!(
                "movement quantity must be positive (got {})",
                request.quantity
            )));
        }
        self.ledger.ensure_product(request.product_id)?;
        self.ledger.ensure_location(request.location_id)?;

        let key = StockKey::new(request.product_id, request.location_id);
        let movement = with_retry(self.ledger.config().retry, "record_stock_movement", key, |_| {
            let now = Utc::now();
            let mut levels = self.ledger.stock_levels().plan(now);
            let change = match request.direction {
                MovementDirection::In => levels.add(key, request.quantity)?,
                MovementDirection::Out => levels.remove(key, request.quantity)?,
            };
            let movement = StockMovement::record(
                key,
                request.direction,
                request.quantity,
                change.before,
                MovementReference::external(request.reference_type, request.reference_id),
                now,
                actor,
                request.notes.clone(),
            )?;
            let total = self
                .ledger
                .product_totals()
                .plan_increment(request.product_id, change.delta())?;

            let mut changes = ChangeSet::new();
            changes.push_movement(movement.clone());
            for w in levels.into_writes() {
                changes.push_level(w);
            }
            changes.push_total(total);
            self.ledger.store().commit(changes)?;
            Ok(movement)
        })?;

        info!(
            product_id = %key.product_id,
            location_id = %key.location_id,
            direction = ?movement.direction(),
            quantity = movement.quantity(),
            reference_type = movement.reference_type().as_str(),
            new_quantity = movement.new_quantity(),
            "stock movement recorded"
        );
        self.ledger.audit(
            AuditEntry::new(
                AuditAction::StockMovementRecorded,
                EntityRef::new(EntityKind::StockLevel, key),
                Utc::now(),
            )
            .with_after(&movement)
            .with_actor(actor),
        );
        Ok(movement)
    }

    /// Ledger rows for one (product, location), oldest first.
    pub fn history(&self, product_id: ProductId, location_id: LocationId) -> LedgerResult<Vec<StockMovement>> {
        let key = StockKey::new(product_id, location_id);
        Ok(self
            .ledger
            .store()
            .movements()?
            .into_iter()
            .filter(|m| m.key() == key)
            .collect())
    }
}
