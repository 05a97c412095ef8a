use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use batchledger_core::{AggregateRoot, LocationId, ProductId};
use batchledger_inventory::{Batch, BatchId, BatchNumber, StockKey, StockLevel, StockMovement};

use super::r#trait::{
    BatchWrite, ChangeSet, LedgerSnapshot, LedgerStore, LocationKind, LocationRecord,
    ProductRecord, ProductTotalWrite, StoreError,
};

#[derive(Debug, Default)]
struct State {
    products: BTreeMap<ProductId, ProductRecord>,
    locations: BTreeMap<LocationId, LocationRecord>,
    batches: BTreeMap<BatchId, Batch>,
    batch_numbers: HashMap<BatchNumber, BatchId>,
    movements: Vec<StockMovement>,
    levels: BTreeMap<StockKey, StockLevel>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev and the offline reconciler. A commit is validated
/// and applied under one write guard, so readers never observe half of a
/// change set.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from an exported snapshot.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, StoreError> {
        let mut state = State::default();
        for product in snapshot.products {
            state.products.insert(product.product_id, product);
        }
        for location in snapshot.locations {
            state.locations.insert(location.location_id, location);
        }
        for batch in snapshot.batches {
            let number = batch.batch_number().clone();
            if state.batch_numbers.contains_key(&number) {
                return Err(StoreError::DuplicateBatchNumber(number));
            }
            state.batch_numbers.insert(number, batch.id_typed());
            state.batches.insert(batch.id_typed(), batch);
        }
        state.movements = snapshot.movements;
        for level in snapshot.stock_levels {
            state.levels.insert(level.key(), level);
        }
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Make a catalog product known to the ledger (total starts at 0).
    pub fn register_product(&self, name: impl Into<String>) -> Result<ProductId, StoreError> {
        let product_id = ProductId::new();
        self.write()?.products.insert(
            product_id,
            ProductRecord {
                product_id,
                name: name.into(),
                stock_quantity: 0,
            },
        );
        Ok(product_id)
    }

    pub fn register_location(
        &self,
        name: impl Into<String>,
        kind: LocationKind,
    ) -> Result<LocationId, StoreError> {
        let location_id = LocationId::new();
        self.write()?.locations.insert(
            location_id,
            LocationRecord {
                location_id,
                name: name.into(),
                kind,
            },
        );
        Ok(location_id)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl State {
    fn level_quantity(&self, key: &StockKey) -> i64 {
        self.levels.get(key).map(|l| l.quantity).unwrap_or(0)
    }

    fn check_known(&self, product_id: ProductId, location_id: LocationId) -> Result<(), StoreError> {
        if !self.products.contains_key(&product_id) {
            return Err(StoreError::InvalidChange(format!(
                "unknown product {product_id}"
            )));
        }
        if !self.locations.contains_key(&location_id) {
            return Err(StoreError::InvalidChange(format!(
                "unknown location {location_id}"
            )));
        }
        Ok(())
    }

    fn check_batch(&self, write: &BatchWrite) -> Result<(), StoreError> {
        match write {
            BatchWrite::Insert(batch) => {
                if !batch.is_created() {
                    return Err(StoreError::InvalidChange(format!(
                        "batch {} has not been created",
                        batch.id_typed()
                    )));
                }
                if self.batches.contains_key(&batch.id_typed()) {
                    return Err(StoreError::Concurrency(format!(
                        "batch {} already exists",
                        batch.id_typed()
                    )));
                }
                if self.batch_numbers.contains_key(batch.batch_number()) {
                    return Err(StoreError::DuplicateBatchNumber(batch.batch_number().clone()));
                }
            }
            BatchWrite::Update { batch, expected } => {
                let current = self.batches.get(&batch.id_typed()).ok_or_else(|| {
                    StoreError::Concurrency(format!("batch {} no longer exists", batch.id_typed()))
                })?;
                if !expected.matches(current.version()) {
                    return Err(StoreError::Concurrency(format!(
                        "batch {}: expected {expected:?}, found {}",
                        batch.id_typed(),
                        current.version()
                    )));
                }
                if current.batch_number() != batch.batch_number() {
                    return Err(StoreError::InvalidChange(format!(
                        "batch {} cannot change its number",
                        batch.id_typed()
                    )));
                }
            }
            BatchWrite::Purge(purge) => {
                let current = self.batches.get(&purge.batch_id()).ok_or_else(|| {
                    StoreError::Concurrency(format!("batch {} no longer exists", purge.batch_id()))
                })?;
                if !purge.expected().matches(current.version()) {
                    return Err(StoreError::Concurrency(format!(
                        "batch {}: expected {:?}, found {}",
                        purge.batch_id(),
                        purge.expected(),
                        current.version()
                    )));
                }
                if current.allocated_quantity() != 0 {
                    return Err(StoreError::InvalidChange(format!(
                        "batch {} still has {} allocated units",
                        purge.batch_id(),
                        current.allocated_quantity()
                    )));
                }
            }
        }
        Ok(())
    }

    fn check(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        if let Some(write) = &changes.batch {
            self.check_batch(write)?;
        }

        for m in &changes.movements {
            self.check_known(m.product_id(), m.location_id())?;
        }

        let mut seen_keys = HashSet::new();
        for w in &changes.levels {
            self.check_known(w.key.product_id, w.key.location_id)?;
            if !seen_keys.insert(w.key) {
                return Err(StoreError::InvalidChange(format!(
                    "stock level for {} written twice",
                    w.key
                )));
            }
            if w.new_quantity < 0 {
                return Err(StoreError::InvalidChange(format!(
                    "stock level for {} cannot become {}",
                    w.key, w.new_quantity
                )));
            }
            let current = self.level_quantity(&w.key);
            if current != w.expected {
                return Err(StoreError::Concurrency(format!(
                    "stock level for {}: expected {}, found {current}",
                    w.key, w.expected
                )));
            }
        }

        let mut seen_products = HashSet::new();
        for t in &changes.totals {
            let product_id = t.product_id();
            if !seen_products.insert(product_id) {
                return Err(StoreError::InvalidChange(format!(
                    "total for product {product_id} written twice"
                )));
            }
            let record = self.products.get(&product_id).ok_or_else(|| {
                StoreError::InvalidChange(format!("unknown product {product_id}"))
            })?;
            if let ProductTotalWrite::Increment { expected, .. } = t {
                if record.stock_quantity != *expected {
                    return Err(StoreError::Concurrency(format!(
                        "total for product {product_id}: expected {expected}, found {}",
                        record.stock_quantity
                    )));
                }
            }
        }

        Ok(())
    }

    fn apply(&mut self, changes: ChangeSet) {
        match changes.batch {
            Some(BatchWrite::Insert(batch)) => {
                self.batch_numbers
                    .insert(batch.batch_number().clone(), batch.id_typed());
                self.batches.insert(batch.id_typed(), batch);
            }
            Some(BatchWrite::Update { batch, .. }) => {
                self.batches.insert(batch.id_typed(), batch);
            }
            Some(BatchWrite::Purge(purge)) => {
                let batch_id = purge.batch_id();
                if let Some(batch) = self.batches.remove(&batch_id) {
                    self.batch_numbers.remove(batch.batch_number());
                }
                self.movements.retain(|m| !m.belongs_to_batch(batch_id));
            }
            None => {}
        }

        self.movements.extend(changes.movements);

        for w in changes.levels {
            if w.new_quantity == 0 {
                self.levels.remove(&w.key);
            } else {
                self.levels.insert(
                    w.key,
                    StockLevel {
                        product_id: w.key.product_id,
                        location_id: w.key.location_id,
                        quantity: w.new_quantity,
                        updated_at: w.at,
                    },
                );
            }
        }

        for t in changes.totals {
            let total = match t {
                ProductTotalWrite::Increment {
                    product_id, delta, ..
                } => self
                    .products
                    .get(&product_id)
                    .map(|p| p.stock_quantity + delta),
                ProductTotalWrite::Recompute(product_id) => Some(
                    self.levels
                        .values()
                        .filter(|l| l.product_id == product_id)
                        .map(|l| l.quantity)
                        .sum(),
                ),
            };
            if let (Some(record), Some(total)) = (self.products.get_mut(&t.product_id()), total) {
                record.stock_quantity = total;
            }
        }
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn product(&self, product_id: ProductId) -> Result<Option<ProductRecord>, StoreError> {
        Ok(self.read()?.products.get(&product_id).cloned())
    }

    fn products(&self) -> Result<Vec<ProductRecord>, StoreError> {
        Ok(self.read()?.products.values().cloned().collect())
    }

    fn location(&self, location_id: LocationId) -> Result<Option<LocationRecord>, StoreError> {
        Ok(self.read()?.locations.get(&location_id).cloned())
    }

    fn batch(&self, batch_id: BatchId) -> Result<Option<Batch>, StoreError> {
        Ok(self.read()?.batches.get(&batch_id).cloned())
    }

    fn batches(&self) -> Result<Vec<Batch>, StoreError> {
        Ok(self.read()?.batches.values().cloned().collect())
    }

    fn batch_movements(&self, batch_id: BatchId) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self
            .read()?
            .movements
            .iter()
            .filter(|m| m.belongs_to_batch(batch_id))
            .cloned()
            .collect())
    }

    fn movements(&self) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self.read()?.movements.clone())
    }

    fn stock_level(&self, key: StockKey) -> Result<Option<StockLevel>, StoreError> {
        Ok(self.read()?.levels.get(&key).cloned())
    }

    fn stock_levels(&self, product_id: Option<ProductId>) -> Result<Vec<StockLevel>, StoreError> {
        Ok(self
            .read()?
            .levels
            .values()
            .filter(|l| product_id.is_none_or(|p| l.product_id == p))
            .cloned()
            .collect())
    }

    fn snapshot(&self) -> Result<LedgerSnapshot, StoreError> {
        let state = self.read()?;
        Ok(LedgerSnapshot {
            products: state.products.values().cloned().collect(),
            locations: state.locations.values().cloned().collect(),
            batches: state.batches.values().cloned().collect(),
            movements: state.movements.clone(),
            stock_levels: state.levels.values().cloned().collect(),
        })
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;
        state.check(&changes)?;
        state.apply(changes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PurgeBatch, StockLevelWrite};
    use batchledger_core::{Aggregate, AggregateId, ExpectedVersion};
    use batchledger_inventory::{
        BatchAttributes, BatchCommand, CreateBatch, MovementDirection, MovementReference,
        QualityStatus,
    };
    use chrono::{NaiveDate, Utc};

    fn store_with_stock() -> (InMemoryLedgerStore, ProductId, LocationId) {
        let store = InMemoryLedgerStore::new();
        let product = store.register_product("Kraft paper 80gsm").unwrap();
        let location = store.register_location("Main warehouse", LocationKind::Warehouse).unwrap();
        (store, product, location)
    }

    fn new_batch(product_id: ProductId, number: &str) -> Batch {
        let batch_id = BatchId::new(AggregateId::new());
        let mut batch = Batch::empty(batch_id);
        let events = batch
            .handle(&BatchCommand::CreateBatch(CreateBatch {
                batch_id,
                batch_number: BatchNumber::parse(number).unwrap(),
                attributes: BatchAttributes {
                    product_id,
                    quantity_produced: 50,
                    manufacturing_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
                    expiry_date: None,
                    rolls: None,
                    weight_grams: None,
                    cost_price: None,
                    quality_status: QualityStatus::Passed,
                    initial_location: None,
                    produced_by: None,
                    wastage_quantity: 0,
                    wastage_cost: 0,
                    notes: None,
                },
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            batch.apply(e);
        }
        batch
    }

    fn level_write(key: StockKey, expected: i64, new_quantity: i64) -> StockLevelWrite {
        StockLevelWrite {
            key,
            expected,
            new_quantity,
            at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_batch_number_is_rejected() {
        let (store, product, _) = store_with_stock();
        store
            .commit(ChangeSet::new().with_batch(BatchWrite::Insert(new_batch(product, "B20240502-0001"))))
            .unwrap();

        let err = store
            .commit(ChangeSet::new().with_batch(BatchWrite::Insert(new_batch(product, "B20240502-0001"))))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicateBatchNumber(BatchNumber::parse("B20240502-0001").unwrap())
        );
        assert_eq!(store.batches().unwrap().len(), 1);
    }

    #[test]
    fn stale_level_expectation_rejects_whole_change_set() {
        let (store, product, location) = store_with_stock();
        let key = StockKey::new(product, location);
        let mut first = ChangeSet::new();
        first.push_level(level_write(key, 0, 10));
        store.commit(first).unwrap();

        let batch = new_batch(product, "B20240502-0002");
        let mut stale = ChangeSet::new().with_batch(BatchWrite::Insert(batch));
        stale.push_level(level_write(key, 0, 5));
        let err = store.commit(stale).unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));

        assert!(store.batches().unwrap().is_empty());
        assert_eq!(store.stock_level(key).unwrap().unwrap().quantity, 10);
    }

    #[test]
    fn stale_batch_version_is_a_conflict() {
        let (store, product, _) = store_with_stock();
        let batch = new_batch(product, "B20240502-0003");
        store
            .commit(ChangeSet::new().with_batch(BatchWrite::Insert(batch.clone())))
            .unwrap();

        let err = store
            .commit(ChangeSet::new().with_batch(BatchWrite::Update {
                batch,
                expected: ExpectedVersion::Exact(0),
            }))
            .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
    }

    #[test]
    fn zero_level_rows_are_removed_and_recompute_sums_survivors() {
        let (store, product, location) = store_with_stock();
        let other = store.register_location("Van 2", LocationKind::Vehicle).unwrap();
        let a = StockKey::new(product, location);
        let b = StockKey::new(product, other);

        let mut seed = ChangeSet::new();
        seed.push_level(level_write(a, 0, 7));
        seed.push_level(level_write(b, 0, 3));
        seed.push_total(ProductTotalWrite::Increment {
            product_id: product,
            expected: 0,
            delta: 10,
        });
        store.commit(seed).unwrap();

        let mut drain = ChangeSet::new();
        drain.push_level(level_write(a, 7, 0));
        drain.push_total(ProductTotalWrite::Recompute(product));
        store.commit(drain).unwrap();

        assert!(store.stock_level(a).unwrap().is_none());
        assert_eq!(store.stock_levels(Some(product)).unwrap().len(), 1);
        assert_eq!(store.product(product).unwrap().unwrap().stock_quantity, 3);
    }

    #[test]
    fn purge_removes_batch_and_its_ledger_rows_only() {
        let (store, product, location) = store_with_stock();
        let batch = new_batch(product, "B20240502-0004");
        let key = StockKey::new(product, location);

        let own = StockMovement::record(
            key,
            MovementDirection::In,
            5,
            0,
            MovementReference::batch_allocation(&batch),
            Utc::now(),
            None,
            None,
        )
        .unwrap();
        let sale = StockMovement::record(
            key,
            MovementDirection::Out,
            2,
            5,
            MovementReference::external(batchledger_inventory::ReferenceType::Sale, None),
            Utc::now(),
            None,
            None,
        )
        .unwrap();
        let mut seed = ChangeSet::new().with_batch(BatchWrite::Insert(batch.clone()));
        seed.push_movement(own);
        seed.push_movement(sale.clone());
        store.commit(seed).unwrap();

        store
            .commit(ChangeSet::new().with_batch(BatchWrite::Purge(PurgeBatch::new(
                batch.id_typed(),
                ExpectedVersion::Exact(batch.version()),
            ))))
            .unwrap();

        assert!(store.batch(batch.id_typed()).unwrap().is_none());
        assert_eq!(store.movements().unwrap(), vec![sale]);

        // The number is free again.
        store
            .commit(ChangeSet::new().with_batch(BatchWrite::Insert(new_batch(product, "B20240502-0004"))))
            .unwrap();
    }

    #[test]
    fn unknown_location_is_an_invalid_change() {
        let (store, product, _) = store_with_stock();
        let mut changes = ChangeSet::new();
        changes.push_level(level_write(StockKey::new(product, LocationId::new()), 0, 1));
        assert!(matches!(
            store.commit(changes).unwrap_err(),
            StoreError::InvalidChange(_)
        ));
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let (store, product, location) = store_with_stock();
        let mut changes = ChangeSet::new().with_batch(BatchWrite::Insert(new_batch(product, "B20240502-0005")));
        changes.push_level(level_write(StockKey::new(product, location), 0, 4));
        store.commit(changes).unwrap();

        let snapshot = store.snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored =
            InMemoryLedgerStore::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.snapshot().unwrap(), snapshot);
    }
}
