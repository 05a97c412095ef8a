//! The single service boundary for every ledger mutation.
//!
//! `BatchLedger` owns the store, audit sink, event bus and configuration;
//! components are cheap borrowing views created per call
//! (`ledger.allocation().allocate_to_locations(..)`), so they always share the
//! same store and retry policy.

use batchledger_core::{LocationId, ProductId};
use batchledger_events::EventBus;
use batchledger_inventory::{AuditEntry, Batch, BatchId};

use crate::allocation::AllocationEngine;
use crate::audit::{AuditTrail, record_best_effort};
use crate::command_dispatcher::{BatchEnvelope, Decision, publish_committed};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::movements::StockMovementService;
use crate::projections::{ProductAggregator, StockLevelProjector};
use crate::reconciliation::Reconciler;
use crate::registry::{BatchNumberGenerator, BatchRegistry, RandomBatchNumbers};
use crate::store::LedgerStore;

pub struct BatchLedger<S, A, B> {
    store: S,
    audit: A,
    bus: B,
    config: LedgerConfig,
    batch_numbers: Box<dyn BatchNumberGenerator>,
}

impl<S, A, B> core::fmt::Debug for BatchLedger<S, A, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, A, B> BatchLedger<S, A, B>
where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    pub fn new(store: S, audit: A, bus: B, config: LedgerConfig) -> Self {
        Self {
            store,
            audit,
            bus,
            config,
            batch_numbers: Box::new(RandomBatchNumbers),
        }
    }

    /// Replace the batch-number source (tests pin it to force collisions).
    pub fn with_batch_numbers(mut self, generator: impl BatchNumberGenerator + 'static) -> Self {
        self.batch_numbers = Box::new(generator);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn registry(&self) -> BatchRegistry<'_, S, A, B> {
        BatchRegistry::new(self)
    }

    pub fn allocation(&self) -> AllocationEngine<'_, S, A, B> {
        AllocationEngine::new(self)
    }

    pub fn movements(&self) -> StockMovementService<'_, S, A, B> {
        StockMovementService::new(self)
    }

    pub fn stock_levels(&self) -> StockLevelProjector<'_, S> {
        StockLevelProjector::new(&self.store)
    }

    pub fn product_totals(&self) -> ProductAggregator<'_, S> {
        ProductAggregator::new(&self.store)
    }

    pub fn reconciler(&self) -> Reconciler<'_, S, A, B> {
        Reconciler::new(self)
    }

    pub(crate) fn batch_numbers(&self) -> &dyn BatchNumberGenerator {
        self.batch_numbers.as_ref()
    }

    pub(crate) fn load_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.store
            .batch(batch_id)?
            .filter(|b| !b.is_deleted())
            .ok_or_else(|| LedgerError::not_found("batch", batch_id))
    }

    pub(crate) fn ensure_product(&self, product_id: ProductId) -> LedgerResult<()> {
        match self.store.product(product_id)? {
            Some(_) => Ok(()),
            None => Err(LedgerError::not_found("product", product_id)),
        }
    }

    pub(crate) fn ensure_location(&self, location_id: LocationId) -> LedgerResult<()> {
        match self.store.location(location_id)? {
            Some(_) => Ok(()),
            None => Err(LedgerError::not_found("location", location_id)),
        }
    }

    /// Post-commit side effects: publish the decision's events, then audit.
    pub(crate) fn after_commit(&self, decision: &Decision, entry: AuditEntry) {
        publish_committed(
            &self.bus,
            decision.batch.id_typed(),
            decision.base_version,
            &decision.events,
        );
        self.audit(entry);
    }

    pub(crate) fn audit(&self, entry: AuditEntry) {
        record_best_effort(&self.audit, entry);
    }
}
