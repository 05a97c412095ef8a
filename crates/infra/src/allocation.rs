//! Allocation engine: moves unallocated batch quantity into location stock.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use batchledger_core::{ExpectedVersion, LocationId, UserId};
use batchledger_events::EventBus;
use batchledger_inventory::{
    AllocateStock, AllocationLine, AllocationPlan, AuditAction, AuditEntry, Batch, BatchCommand,
    BatchId, MovementDirection, MovementReference, StockKey, StockMovement,
};

use crate::audit::AuditTrail;
use crate::command_dispatcher::{BatchEnvelope, Decision, decide, with_retry};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::BatchLedger;
use crate::registry::entity;
use crate::store::{BatchWrite, ChangeSet, LedgerStore};

/// Result of one committed allocation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub batch: Batch,
    /// Total allocated by this call.
    pub allocated: i64,
    /// One `in` movement per location, in request order.
    pub movements: Vec<StockMovement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Allocate,
    Reverse,
}

impl BulkAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkAction::Allocate => "allocate",
            BulkAction::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    Allocated { quantity: i64 },
    Reversed { released: i64 },
    Skipped { reason: String },
    Failed { error: LedgerError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub batch_id: BatchId,
    pub outcome: BulkOutcome,
}

/// Per-batch results of a bulk call. Earlier successes stay committed
/// whatever happens to later batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReport {
    pub action: BulkAction,
    pub location_id: LocationId,
    pub items: Vec<BulkItem>,
}

impl BulkReport {
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|i| {
                matches!(
                    i.outcome,
                    BulkOutcome::Allocated { .. } | BulkOutcome::Reversed { .. }
                )
            })
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, BulkOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, BulkOutcome::Failed { .. }))
            .count()
    }

    /// Units allocated or released across all batches.
    pub fn total_quantity(&self) -> i64 {
        self.items
            .iter()
            .map(|i| match i.outcome {
                BulkOutcome::Allocated { quantity } => quantity,
                BulkOutcome::Reversed { released } => released,
                _ => 0,
            })
            .sum()
    }

    /// `PartialBulkFailure` if any batch failed.
    pub fn into_result(self) -> LedgerResult<Self> {
        let failures: Vec<(BatchId, LedgerError)> = self
            .items
            .iter()
            .filter_map(|i| match &i.outcome {
                BulkOutcome::Failed { error } => Some((i.batch_id, error.clone())),
                _ => None,
            })
            .collect();
        if failures.is_empty() {
            return Ok(self);
        }
        Err(LedgerError::PartialBulkFailure {
            action: self.action.as_str(),
            total: self.items.len(),
            succeeded: self.succeeded(),
            failures,
        })
    }
}

pub struct AllocationEngine<'a, S, A, B> {
    pub(crate) ledger: &'a BatchLedger<S, A, B>,
}

struct Committed {
    before: Batch,
    decision: Decision,
    movements: Vec<StockMovement>,
    allocated: i64,
}

impl<'a, S, A, B> AllocationEngine<'a, S, A, B>
where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    pub(crate) fn new(ledger: &'a BatchLedger<S, A, B>) -> Self {
        Self { ledger }
    }

    /// Allocate part of a batch's remainder to one or more locations.
    ///
    /// All-or-nothing: the batch, every touched stock level, the ledger rows
    /// and the product total are committed together or not at all.
    pub fn allocate_to_locations(
        &self,
        batch_id: BatchId,
        lines: &[AllocationLine],
        actor: Option<UserId>,
    ) -> LedgerResult<AllocationOutcome> {
        let plan = AllocationPlan::from_lines(lines)?;
        for line in plan.lines() {
            self.ledger.ensure_location(line.location_id)?;
        }

        match self.allocate_with(batch_id, actor, "allocate_to_locations", |_| Ok(Some(plan.clone())))? {
            Some(outcome) => Ok(outcome),
            None => Err(LedgerError::InvariantViolation(format!(
                "allocation of batch {batch_id} produced no plan"
            ))),
        }
    }

    /// Apply one action to many batches, each in its own commit.
    ///
    /// `Allocate` moves each batch's whole remainder to `location_id`; fully
    /// allocated batches are skipped. `Reverse` fully reverses each batch
    /// wherever its stock went.
    pub fn bulk_allocate_to_location(
        &self,
        batch_ids: &[BatchId],
        location_id: LocationId,
        action: BulkAction,
        actor: Option<UserId>,
    ) -> LedgerResult<BulkReport> {
        if batch_ids.is_empty() {
            return Err(LedgerError::Validation(format!(
                "bulk {} needs at least one batch",
                action.as_str()
            )));
        }
        if action == BulkAction::Allocate {
            self.ledger.ensure_location(location_id)?;
        }

        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::with_capacity(batch_ids.len());
        for &batch_id in batch_ids {
            if !seen.insert(batch_id) {
                continue;
            }
            let outcome = match action {
                BulkAction::Allocate => self.allocate_remaining(batch_id, location_id, actor),
                BulkAction::Reverse => self.reverse_in_bulk(batch_id, actor),
            };
            if let BulkOutcome::Failed { error } = &outcome {
                warn!(batch_id = %batch_id, action = action.as_str(), error = %error, "bulk item failed");
            }
            items.push(BulkItem { batch_id, outcome });
        }

        let report = BulkReport {
            action,
            location_id,
            items,
        };
        info!(
            action = action.as_str(),
            location_id = %location_id,
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            quantity = report.total_quantity(),
            "bulk operation finished"
        );
        Ok(report)
    }

    fn allocate_remaining(&self, batch_id: BatchId, location_id: LocationId, actor: Option<UserId>) -> BulkOutcome {
        let result = self.allocate_with(batch_id, actor, "bulk_allocate", |batch| {
            let remaining = batch.remaining_quantity();
            if remaining == 0 {
                return Ok(None);
            }
            Ok(Some(AllocationPlan::single(location_id, remaining)?))
        });
        match result {
            Ok(Some(outcome)) => BulkOutcome::Allocated {
                quantity: outcome.allocated,
            },
            Ok(None) => BulkOutcome::Skipped {
                reason: "nothing left to allocate".to_string(),
            },
            Err(error) => BulkOutcome::Failed { error },
        }
    }

    fn reverse_in_bulk(&self, batch_id: BatchId, actor: Option<UserId>) -> BulkOutcome {
        match self.reverse_batch_allocations(batch_id, actor) {
            Ok(outcome) if outcome.released == 0 => BulkOutcome::Skipped {
                reason: "nothing allocated".to_string(),
            },
            Ok(outcome) => BulkOutcome::Reversed {
                released: outcome.released,
            },
            Err(error) => BulkOutcome::Failed { error },
        }
    }

    /// Shared allocation path. `plan_for` sees the freshly read batch on every
    /// attempt and returns `None` to skip it.
    fn allocate_with(
        &self,
        batch_id: BatchId,
        actor: Option<UserId>,
        operation: &'static str,
        plan_for: impl Fn(&Batch) -> LedgerResult<Option<AllocationPlan>>,
    ) -> LedgerResult<Option<AllocationOutcome>> {
        let committed = with_retry(self.ledger.config().retry, operation, batch_id, |_| {
            let batch = self.ledger.load_batch(batch_id)?;
            let Some(plan) = plan_for(&batch)? else {
                return Ok(None);
            };
            self.commit_plan(batch, &plan, actor).map(Some)
        })?;
        let Some(committed) = committed else {
            return Ok(None);
        };

        let batch = committed.decision.batch.clone();
        info!(
            batch_id = %batch_id,
            batch_number = %batch.batch_number(),
            product_id = %batch.product_id(),
            quantity = committed.allocated,
            locations = committed.movements.len(),
            "batch allocated"
        );
        self.ledger.after_commit(
            &committed.decision,
            AuditEntry::new(AuditAction::BatchAllocated, entity(&batch), Utc::now())
                .with_before(&committed.before)
                .with_after(&batch)
                .with_actor(actor)
                .with_notes(format!(
                    "allocated {} units to {} location(s)",
                    committed.allocated,
                    committed.movements.len()
                )),
        );

        Ok(Some(AllocationOutcome {
            batch,
            allocated: committed.allocated,
            movements: committed.movements,
        }))
    }

    fn commit_plan(&self, batch: Batch, plan: &AllocationPlan, actor: Option<UserId>) -> LedgerResult<Committed> {
        let remaining = batch.remaining_quantity();
        if plan.total() > remaining {
            return Err(LedgerError::InsufficientBatchQuantity {
                batch_id: batch.id_typed(),
                batch_number: batch.batch_number().clone(),
                requested: plan.total(),
                remaining,
            });
        }

        let now = Utc::now();
        let decision = decide(
            &batch,
            BatchCommand::AllocateStock(AllocateStock {
                batch_id: batch.id_typed(),
                quantity: plan.total(),
                occurred_at: now,
            }),
        )?;

        let product_id = batch.product_id();
        let mut levels = self.ledger.stock_levels().plan(now);
        let mut movements = Vec::with_capacity(plan.lines().len());
        for line in plan.lines() {
            let key = StockKey::new(product_id, line.location_id);
            let change = levels.add(key, line.quantity)?;
            movements.push(StockMovement::record(
                key,
                MovementDirection::In,
                line.quantity,
                change.before,
                MovementReference::batch_allocation(&batch),
                now,
                actor,
                None,
            )?);
        }
        let total = self
            .ledger
            .product_totals()
            .plan_increment(product_id, plan.total())?;

        let mut changes = ChangeSet::new().with_batch(BatchWrite::Update {
            batch: decision.batch.clone(),
            expected: ExpectedVersion::Exact(decision.base_version),
        });
        for m in &movements {
            changes.push_movement(m.clone());
        }
        for w in levels.into_writes() {
            changes.push_level(w);
        }
        changes.push_total(total);
        self.ledger.store().commit(changes)?;

        Ok(Committed {
            before: batch,
            decision,
            movements,
            allocated: plan.total(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditTrail;
    use crate::config::LedgerConfig;
    use crate::store::{InMemoryLedgerStore, LocationKind};
    use batchledger_core::ProductId;
    use batchledger_events::InMemoryEventBus;
    use batchledger_inventory::{LifecycleStatus, NewBatch, ReferenceType};
    use chrono::NaiveDate;
    use std::sync::Arc;

    type TestLedger =
        BatchLedger<Arc<InMemoryLedgerStore>, Arc<InMemoryAuditTrail>, InMemoryEventBus<BatchEnvelope>>;

    struct Fixture {
        ledger: TestLedger,
        product: ProductId,
        north: LocationId,
        south: LocationId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let product = store.register_product("Polyester yarn").unwrap();
        let north = store.register_location("North", LocationKind::Warehouse).unwrap();
        let south = store.register_location("South", LocationKind::Warehouse).unwrap();
        let ledger = BatchLedger::new(
            store,
            Arc::new(InMemoryAuditTrail::new()),
            InMemoryEventBus::new(),
            LedgerConfig::default(),
        );
        Fixture {
            ledger,
            product,
            north,
            south,
        }
    }

    fn batch(fx: &Fixture, produced: i64) -> Batch {
        fx.ledger
            .registry()
            .create_batch(
                NewBatch::new(fx.product, produced, NaiveDate::from_ymd_opt(2024, 2, 2).unwrap()),
                None,
            )
            .unwrap()
    }

    #[test]
    fn partial_allocation_keeps_batch_active() {
        let fx = fixture();
        let b = batch(&fx, 50);
        let outcome = fx
            .ledger
            .allocation()
            .allocate_to_locations(b.id_typed(), &[AllocationLine::new(fx.north, 20)], None)
            .unwrap();

        assert_eq!(outcome.allocated, 20);
        assert_eq!(outcome.batch.remaining_quantity(), 30);
        assert_eq!(outcome.batch.lifecycle_status(), LifecycleStatus::Active);
        assert_eq!(outcome.movements[0].reference_type(), ReferenceType::BatchAllocation);
        assert_eq!(outcome.movements[0].previous_quantity(), 0);
        assert_eq!(outcome.movements[0].new_quantity(), 20);
    }

    #[test]
    fn over_allocation_writes_nothing() {
        let fx = fixture();
        let b = batch(&fx, 50);
        let err = fx
            .ledger
            .allocation()
            .allocate_to_locations(
                b.id_typed(),
                &[AllocationLine::new(fx.north, 30), AllocationLine::new(fx.south, 30)],
                None,
            )
            .unwrap_err();

        assert_eq!(err.shortfall(), Some(10));
        let levels = fx.ledger.stock_levels();
        assert_eq!(levels.get_stock_level(fx.product, fx.north).unwrap(), 0);
        assert_eq!(levels.get_stock_level(fx.product, fx.south).unwrap(), 0);
        assert!(fx.ledger.store().movements().unwrap().is_empty());
        assert_eq!(fx.ledger.registry().get_batch(b.id_typed()).unwrap().allocated_quantity(), 0);
    }

    #[test]
    fn negative_or_empty_lines_are_rejected_before_writes() {
        let fx = fixture();
        let b = batch(&fx, 50);
        let engine = fx.ledger.allocation();
        assert!(matches!(
            engine
                .allocate_to_locations(b.id_typed(), &[AllocationLine::new(fx.north, -1)], None)
                .unwrap_err(),
            LedgerError::Validation(_)
        ));
        assert!(matches!(
            engine
                .allocate_to_locations(b.id_typed(), &[AllocationLine::new(fx.north, 0)], None)
                .unwrap_err(),
            LedgerError::Validation(_)
        ));
        assert!(matches!(
            engine.allocate_to_locations(b.id_typed(), &[], None).unwrap_err(),
            LedgerError::Validation(_)
        ));
    }

    #[test]
    fn unknown_location_is_not_found() {
        let fx = fixture();
        let b = batch(&fx, 50);
        let err = fx
            .ledger
            .allocation()
            .allocate_to_locations(b.id_typed(), &[AllocationLine::new(LocationId::new(), 5)], None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "location", .. }));
    }

    #[test]
    fn bulk_with_no_batches_is_a_validation_error() {
        let fx = fixture();
        let err = fx
            .ledger
            .allocation()
            .bulk_allocate_to_location(&[], fx.north, BulkAction::Allocate, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn bulk_failures_convert_to_partial_failure() {
        let fx = fixture();
        let b = batch(&fx, 10);
        let missing = BatchId::new(batchledger_core::AggregateId::new());

        let report = fx
            .ledger
            .allocation()
            .bulk_allocate_to_location(&[b.id_typed(), missing, b.id_typed()], fx.north, BulkAction::Allocate, None)
            .unwrap();
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);

        match report.into_result().unwrap_err() {
            LedgerError::PartialBulkFailure {
                total,
                succeeded,
                failures,
                ..
            } => {
                assert_eq!((total, succeeded), (2, 1));
                assert_eq!(failures[0].0, missing);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
