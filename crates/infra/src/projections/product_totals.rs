use std::collections::BTreeMap;

use tracing::info;

use batchledger_core::ProductId;

use crate::error::{LedgerError, LedgerResult};
use crate::store::{ChangeSet, LedgerStore, ProductTotalWrite};

/// Total on-hand quantity per product.
///
/// Two update paths: [`plan_increment`](Self::plan_increment) adds a known
/// delta to the stored total (allocation, movements), while
/// [`recompute`](Self::recompute) rebuilds it from the surviving stock levels
/// (reversal, deletion, drift repair).
#[derive(Debug)]
pub struct ProductAggregator<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> ProductAggregator<'a, S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Stored total for a product.
    pub fn get_product_total(&self, product_id: ProductId) -> LedgerResult<i64> {
        self.store
            .product(product_id)?
            .map(|p| p.stock_quantity)
            .ok_or_else(|| LedgerError::not_found("product", product_id))
    }

    /// Sum of the product's stored stock levels.
    pub fn sum_of_levels(&self, product_id: ProductId) -> LedgerResult<i64> {
        Ok(self
            .store
            .stock_levels(Some(product_id))?
            .iter()
            .map(|l| l.quantity)
            .sum())
    }

    /// Fast-path write adding `delta` to the total as it stands now.
    pub fn plan_increment(&self, product_id: ProductId, delta: i64) -> LedgerResult<ProductTotalWrite> {
        let expected = self.get_product_total(product_id)?;
        Ok(ProductTotalWrite::Increment {
            product_id,
            expected,
            delta,
        })
    }

    /// Rebuild one product's total from its stock levels.
    pub fn recompute(&self, product_id: ProductId) -> LedgerResult<i64> {
        let before = self.get_product_total(product_id)?;
        let mut changes = ChangeSet::new();
        changes.push_total(ProductTotalWrite::Recompute(product_id));
        self.store.commit(changes)?;

        let after = self.get_product_total(product_id)?;
        if after != before {
            info!(product_id = %product_id, before, after, "product total recomputed");
        }
        Ok(after)
    }

    /// Rebuild every product's total in one commit.
    pub fn recompute_all(&self) -> LedgerResult<BTreeMap<ProductId, i64>> {
        let products = self.store.products()?;
        let mut changes = ChangeSet::new();
        for product in &products {
            changes.push_total(ProductTotalWrite::Recompute(product.product_id));
        }
        self.store.commit(changes)?;

        Ok(self
            .store
            .products()?
            .into_iter()
            .map(|p| (p.product_id, p.stock_quantity))
            .collect())
    }
}
