//! Full reversal of a batch's allocations.

use chrono::Utc;
use tracing::{info, warn};

use batchledger_core::{ExpectedVersion, UserId};
use batchledger_events::EventBus;
use batchledger_inventory::{
    AuditAction, AuditEntry, Batch, BatchCommand, BatchId, MovementDirection, MovementReference,
    ReverseAllocations, StockMovement, outstanding_allocations,
};

use crate::allocation::AllocationEngine;
use crate::audit::AuditTrail;
use crate::command_dispatcher::{BatchEnvelope, decide, with_retry};
use crate::error::LedgerResult;
use crate::registry::entity;
use crate::store::{BatchWrite, ChangeSet, LedgerStore, ProductTotalWrite};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversalOutcome {
    pub batch: Batch,
    /// Allocated quantity released back to the batch.
    pub released: i64,
    /// Compensating `out` movements written by this reversal.
    pub movements: Vec<StockMovement>,
}

impl ReversalOutcome {
    pub fn is_noop(&self) -> bool {
        self.released == 0
    }
}

/// Allocation rows covering the batch's current allocated quantity.
///
/// Every allocation since the last reversal is still uncompensated, and
/// together they sum to `allocated_quantity`; older uncompensated rows (whose
/// stock had already been consumed when they were reversed) are skipped.
fn allocations_to_reverse<'m>(batch: &Batch, rows: &'m [StockMovement]) -> Vec<&'m StockMovement> {
    let mut open = outstanding_allocations(batch.id_typed(), rows);
    let mut covered = 0;
    let mut selected = Vec::new();
    while covered < batch.allocated_quantity() {
        let Some(m) = open.pop() else { break };
        covered += m.quantity();
        selected.push(m);
    }
    if covered != batch.allocated_quantity() {
        warn!(
            batch_id = %batch.id_typed(),
            allocated = batch.allocated_quantity(),
            covered,
            "allocation rows do not match allocated quantity"
        );
    }
    selected.reverse();
    selected
}

impl<S, A, B> AllocationEngine<'_, S, A, B>
where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    /// Undo every outstanding allocation of a batch.
    ///
    /// Each reversed allocation gets a compensating `out` movement for what
    /// could actually be taken back (levels never go below zero), the
    /// product total is recomputed from the surviving levels, and the batch
    /// returns to `allocated_quantity = 0`, `active`. A batch with nothing
    /// allocated is left untouched.
    pub fn reverse_batch_allocations(
        &self,
        batch_id: BatchId,
        actor: Option<UserId>,
    ) -> LedgerResult<ReversalOutcome> {
        let committed = with_retry(
            self.ledger.config().retry,
            "reverse_batch_allocations",
            batch_id,
            |_| {
                let batch = self.ledger.load_batch(batch_id)?;
                if batch.allocated_quantity() == 0 {
                    return Ok(None);
                }

                let now = Utc::now();
                let decision = decide(
                    &batch,
                    BatchCommand::ReverseAllocations(ReverseAllocations {
                        batch_id,
                        occurred_at: now,
                    }),
                )?;

                let rows = self.ledger.store().batch_movements(batch_id)?;
                let mut levels = self.ledger.stock_levels().plan(now);
                let mut movements = Vec::new();
                for allocation in allocations_to_reverse(&batch, &rows) {
                    let change = levels.remove_floored(allocation.key(), allocation.quantity())?;
                    let removed = change.before - change.after;
                    if removed < allocation.quantity() {
                        warn!(
                            batch_id = %batch_id,
                            location_id = %allocation.location_id(),
                            allocated = allocation.quantity(),
                            removed,
                            "stock already consumed; reversal floored at zero"
                        );
                    }
                    if removed == 0 {
                        continue;
                    }
                    movements.push(StockMovement::record(
                        allocation.key(),
                        MovementDirection::Out,
                        removed,
                        change.before,
                        MovementReference::batch_deallocation(&batch, allocation.id()),
                        now,
                        actor,
                        Some(format!("reversal of allocation {}", allocation.id())),
                    )?);
                }

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
                changes.push_total(ProductTotalWrite::Recompute(batch.product_id()));
                self.ledger.store().commit(changes)?;

                Ok(Some((batch, decision, movements)))
            },
        )?;

        let Some((before, decision, movements)) = committed else {
            return Ok(ReversalOutcome {
                batch: self.ledger.load_batch(batch_id)?,
                released: 0,
                movements: Vec::new(),
            });
        };

        let released = before.allocated_quantity();
        info!(
            batch_id = %batch_id,
            batch_number = %before.batch_number(),
            product_id = %before.product_id(),
            released,
            movements = movements.len(),
            "batch allocations reversed"
        );
        self.ledger.after_commit(
            &decision,
            AuditEntry::new(AuditAction::BatchAllocationReversed, entity(&before), Utc::now())
                .with_before(&before)
                .with_after(&decision.batch)
                .with_actor(actor)
                .with_notes(format!(
                    "released {released} units; {} compensating movement(s)",
                    movements.len()
                )),
        );

        Ok(ReversalOutcome {
            batch: decision.batch,
            released,
            movements,
        })
    }
}
