//! Batch registry: creation, update and deletion of batch records.

use chrono::{NaiveDate, Utc};
use rand::Rng;
use tracing::{debug, info};

use batchledger_core::{AggregateId, ExpectedVersion, UserId};
use batchledger_events::EventBus;
use batchledger_inventory::{
    AuditAction, AuditEntry, Batch, BatchCommand, BatchId, BatchNumber, BatchPatch, BatchSource,
    CreateBatch, DeleteBatch, EntityKind, EntityRef, NewBatch, StockMovement, UpdateBatch,
};

use crate::audit::AuditTrail;
use crate::command_dispatcher::{BatchEnvelope, decide, with_retry};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::BatchLedger;
use crate::reversal::ReversalOutcome;
use crate::store::{BatchWrite, ChangeSet, LedgerStore, PurgeBatch, StoreError};

/// Source of candidate batch numbers.
pub trait BatchNumberGenerator: Send + Sync {
    fn next(&self, manufacturing_date: NaiveDate) -> BatchNumber;
}

/// `B{YYYYMMDD}-{NNNN}` with a random four-digit suffix.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBatchNumbers;

impl BatchNumberGenerator for RandomBatchNumbers {
    fn next(&self, manufacturing_date: NaiveDate) -> BatchNumber {
        let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
        BatchNumber::generate(manufacturing_date, suffix)
    }
}

/// What a deletion removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedBatch {
    /// Last state before the purge.
    pub batch: Batch,
    pub reversal: ReversalOutcome,
    /// Ledger rows pruned with the batch.
    pub purged_movements: usize,
}

pub struct BatchRegistry<'a, S, A, B> {
    ledger: &'a BatchLedger<S, A, B>,
}

impl<'a, S, A, B> BatchRegistry<'a, S, A, B>
where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    pub(crate) fn new(ledger: &'a BatchLedger<S, A, B>) -> Self {
        Self { ledger }
    }

    pub fn get_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.ledger.load_batch(batch_id)
    }

    pub fn list_batches(&self) -> LedgerResult<Vec<Batch>> {
        Ok(self.ledger.store().batches()?)
    }

    /// Allocation and deallocation rows of a batch, oldest first.
    pub fn batch_movements(&self, batch_id: BatchId) -> LedgerResult<Vec<StockMovement>> {
        self.ledger.load_batch(batch_id)?;
        Ok(self.ledger.store().batch_movements(batch_id)?)
    }

    /// Register a new batch with a freshly generated, unique batch number.
    pub fn create_batch(&self, request: NewBatch, actor: Option<UserId>) -> LedgerResult<Batch> {
        let (attributes, source) = request.into_attributes()?;
        self.ledger.ensure_product(attributes.product_id)?;
        if let Some(location_id) = attributes.initial_location {
            self.ledger.ensure_location(location_id)?;
        }

        let batch_id = BatchId::new(AggregateId::new());
        let attempts = self.ledger.config().batch_number_attempts;
        for attempt in 1..=attempts {
            let batch_number = self
                .ledger
                .batch_numbers()
                .next(attributes.manufacturing_date);
            let decision = decide(
                &Batch::empty(batch_id),
                BatchCommand::CreateBatch(CreateBatch {
                    batch_id,
                    batch_number: batch_number.clone(),
                    attributes: attributes.clone(),
                    occurred_at: Utc::now(),
                }),
            )?;

            let changes = ChangeSet::new().with_batch(BatchWrite::Insert(decision.batch.clone()));
            match self.ledger.store().commit(changes) {
                Ok(()) => {}
                Err(StoreError::DuplicateBatchNumber(taken)) => {
                    debug!(batch_number = %taken, attempt, "batch number taken; regenerating");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let batch = decision.batch.clone();
            info!(
                batch_id = %batch_id,
                batch_number = %batch.batch_number(),
                product_id = %batch.product_id(),
                quantity = batch.quantity_produced(),
                "batch created"
            );
            let mut entry = AuditEntry::new(AuditAction::BatchCreated, entity(&batch), Utc::now())
                .with_after(&batch)
                .with_actor(actor);
            if let BatchSource::DocumentExtraction { document_ref } = &source {
                entry = entry.with_notes(format!("extracted from document {document_ref}"));
            }
            self.ledger.after_commit(&decision, entry);
            return Ok(batch);
        }

        Err(LedgerError::ConcurrencyConflict {
            operation: "create_batch",
            subject: format!(
                "batch numbers for {}",
                attributes.manufacturing_date.format("%Y-%m-%d")
            ),
            attempts,
        })
    }

    /// Change descriptive fields of a batch.
    ///
    /// Allocation figures and the batch number are not part of [`BatchPatch`];
    /// they only move through the allocation engine.
    pub fn update_batch(
        &self,
        batch_id: BatchId,
        patch: BatchPatch,
        actor: Option<UserId>,
    ) -> LedgerResult<Batch> {
        if let Some(product_id) = patch.product_id {
            self.ledger.ensure_product(product_id)?;
        }
        if let Some(location_id) = patch.initial_location {
            self.ledger.ensure_location(location_id)?;
        }

        let (before, decision) =
            with_retry(self.ledger.config().retry, "update_batch", batch_id, |_| {
                let before = self.ledger.load_batch(batch_id)?;
                let decision = decide(
                    &before,
                    BatchCommand::UpdateBatch(UpdateBatch {
                        batch_id,
                        patch: patch.clone(),
                        occurred_at: Utc::now(),
                    }),
                )?;
                self.ledger
                    .store()
                    .commit(ChangeSet::new().with_batch(BatchWrite::Update {
                        batch: decision.batch.clone(),
                        expected: ExpectedVersion::Exact(decision.base_version),
                    }))?;
                Ok((before, decision))
            })?;

        info!(batch_id = %batch_id, batch_number = %before.batch_number(), "batch updated");
        self.ledger.after_commit(
            &decision,
            AuditEntry::new(AuditAction::BatchUpdated, entity(&before), Utc::now())
                .with_before(&before)
                .with_after(&decision.batch)
                .with_actor(actor),
        );
        Ok(decision.batch)
    }

    /// Fully reverse a batch, then purge it and every ledger row written on
    /// its behalf.
    ///
    /// The purge is the only operation that removes movements; it runs as its
    /// own commit after the reversal has been committed.
    ///
    /// A batch with allocations leaves two audit entries: the reversal's own
    /// `batch_allocation_reversed` entry, then `batch_deleted`. An unallocated
    /// batch leaves only `batch_deleted`.
    pub fn delete_batch(&self, batch_id: BatchId, actor: Option<UserId>) -> LedgerResult<DeletedBatch> {
        let allocation = self.ledger.allocation();

        let (reversal, before, decision, purged_movements) =
            with_retry(self.ledger.config().retry, "delete_batch", batch_id, |_| {
                // Re-run every attempt: an allocation may have slipped in
                // between the reversal commit and the purge.
                let reversal = allocation.reverse_batch_allocations(batch_id, actor)?;

                let before = self.ledger.load_batch(batch_id)?;
                let decision = decide(
                    &before,
                    BatchCommand::DeleteBatch(DeleteBatch {
                        batch_id,
                        occurred_at: Utc::now(),
                    }),
                )
                .map_err(|err| match err {
                    // Allocated again since the reversal: retry the pair.
                    LedgerError::InvariantViolation(msg) => {
                        LedgerError::Store(StoreError::Concurrency(msg))
                    }
                    other => other,
                })?;
                let purged = self.ledger.store().batch_movements(batch_id)?.len();

                self.ledger
                    .store()
                    .commit(ChangeSet::new().with_batch(BatchWrite::Purge(PurgeBatch::new(
                        batch_id,
                        ExpectedVersion::Exact(decision.base_version),
                    ))))?;
                Ok((reversal, before, decision, purged))
            })?;

        info!(
            batch_id = %batch_id,
            batch_number = %before.batch_number(),
            released = reversal.released,
            purged_movements,
            "batch deleted"
        );
        self.ledger.after_commit(
            &decision,
            AuditEntry::new(AuditAction::BatchDeleted, entity(&before), Utc::now())
                .with_before(&before)
                .with_actor(actor)
                .with_notes(format!(
                    "released {} units; purged {purged_movements} ledger rows",
                    reversal.released
                )),
        );

        Ok(DeletedBatch {
            batch: before,
            reversal,
            purged_movements,
        })
    }
}

pub(crate) fn entity(batch: &Batch) -> EntityRef {
    EntityRef::new(EntityKind::Batch, batch.id_typed()).with_label(batch.batch_number().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditTrail;
    use crate::config::LedgerConfig;
    use crate::store::{InMemoryLedgerStore, LocationKind};
    use batchledger_core::ProductId;
    use batchledger_events::InMemoryEventBus;
    use batchledger_inventory::{AllocationLine, LifecycleStatus};
    use std::sync::Arc;

    type TestLedger =
        BatchLedger<Arc<InMemoryLedgerStore>, Arc<InMemoryAuditTrail>, InMemoryEventBus<BatchEnvelope>>;

    fn ledger() -> (TestLedger, Arc<InMemoryAuditTrail>, ProductId) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let product = store.register_product("Jute sacking").unwrap();
        let audit = Arc::new(InMemoryAuditTrail::new());
        let ledger = BatchLedger::new(
            store,
            audit.clone(),
            InMemoryEventBus::new(),
            LedgerConfig::default(),
        );
        (ledger, audit, product)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 14).unwrap()
    }

    #[test]
    fn create_rejects_unknown_product() {
        let (ledger, _, _) = ledger();
        let err = ledger
            .registry()
            .create_batch(NewBatch::new(ProductId::new(), 10, date()), None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "product", .. }));
    }

    #[test]
    fn create_rejects_unknown_initial_location() {
        let (ledger, _, product) = ledger();
        let mut request = NewBatch::new(product, 10, date());
        request.initial_location = Some(batchledger_core::LocationId::new());
        let err = ledger.registry().create_batch(request, None).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "location", .. }));
    }

    #[test]
    fn create_assigns_dated_batch_number_and_audits() {
        let (ledger, audit, product) = ledger();
        let batch = ledger
            .registry()
            .create_batch(NewBatch::new(product, 25, date()), None)
            .unwrap();

        assert!(batch.batch_number().as_str().starts_with("B20240614-"));
        assert_eq!(batch.batch_number().as_str().len(), "B20240614-0000".len());
        assert_eq!(batch.allocated_quantity(), 0);
        assert_eq!(batch.lifecycle_status(), LifecycleStatus::Active);

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::BatchCreated);
        assert!(entries[0].after.is_some());
    }

    #[test]
    fn document_extracted_batches_note_their_source() {
        let (ledger, audit, product) = ledger();
        let mut request = NewBatch::new(product, 5, date());
        request.source = BatchSource::DocumentExtraction {
            document_ref: "scan-0042.pdf".to_string(),
        };
        ledger.registry().create_batch(request, None).unwrap();
        assert_eq!(
            audit.entries()[0].notes.as_deref(),
            Some("extracted from document scan-0042.pdf")
        );
    }

    #[test]
    fn update_records_before_and_after() {
        let (ledger, audit, product) = ledger();
        let batch = ledger
            .registry()
            .create_batch(NewBatch::new(product, 25, date()), None)
            .unwrap();

        let updated = ledger
            .registry()
            .update_batch(
                batch.id_typed(),
                BatchPatch {
                    notes: Some("re-weighed".to_string()),
                    weight_grams: Some(9_800),
                    ..BatchPatch::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(updated.attributes().weight_grams, Some(9_800));

        let last = audit.entries().pop().unwrap();
        assert_eq!(last.action, AuditAction::BatchUpdated);
        assert!(last.before.is_some() && last.after.is_some());
    }

    #[test]
    fn empty_patch_is_a_validation_error() {
        let (ledger, _, product) = ledger();
        let batch = ledger
            .registry()
            .create_batch(NewBatch::new(product, 25, date()), None)
            .unwrap();
        let err = ledger
            .registry()
            .update_batch(batch.id_typed(), BatchPatch::default(), None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn unknown_batch_is_not_found() {
        let (ledger, _, _) = ledger();
        let missing = BatchId::new(AggregateId::new());
        assert!(matches!(
            ledger.registry().get_batch(missing).unwrap_err(),
            LedgerError::NotFound { entity: "batch", .. }
        ));
        assert!(matches!(
            ledger.registry().delete_batch(missing, None).unwrap_err(),
            LedgerError::NotFound { entity: "batch", .. }
        ));
    }

    #[test]
    fn delete_audits_reversal_then_deletion() {
        let (ledger, audit, product) = ledger();
        let depot = ledger
            .store()
            .register_location("Depot", LocationKind::Warehouse)
            .unwrap();
        let registry = ledger.registry();
        let allocated = registry
            .create_batch(NewBatch::new(product, 12, date()), None)
            .unwrap();
        let idle = registry
            .create_batch(NewBatch::new(product, 5, date()), None)
            .unwrap();
        ledger
            .allocation()
            .allocate_to_locations(
                allocated.id_typed(),
                &[AllocationLine::new(depot, 12)],
                None,
            )
            .unwrap();

        registry.delete_batch(allocated.id_typed(), None).unwrap();
        registry.delete_batch(idle.id_typed(), None).unwrap();

        let actions = |batch: &Batch| -> Vec<AuditAction> {
            audit.entries_for(&entity(batch)).iter().map(|e| e.action).collect()
        };
        assert_eq!(
            actions(&allocated),
            vec![
                AuditAction::BatchCreated,
                AuditAction::BatchAllocated,
                AuditAction::BatchAllocationReversed,
                AuditAction::BatchDeleted,
            ]
        );
        assert_eq!(
            actions(&idle),
            vec![AuditAction::BatchCreated, AuditAction::BatchDeleted]
        );
    }
}
