//! Stock levels and the pure ledger derivations behind them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchledger_core::{LocationId, ProductId};

use crate::movement::StockMovement;

/// Unique key of a stock level row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: ProductId,
    pub location_id: LocationId,
}

impl StockKey {
    pub fn new(product_id: ProductId, location_id: LocationId) -> Self {
        Self {
            product_id,
            location_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "product {} at location {}",
            self.product_id, self.location_id
        )
    }
}

/// Materialized on-hand quantity of one product at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub updated_at: DateTime<Utc>,
}

impl StockLevel {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.location_id)
    }
}

/// Re-derive every (product, location) quantity from ledger rows.
///
/// Pairs whose signed movements cancel out are omitted, matching the rule that
/// zero-quantity levels are not stored.
pub fn derive_levels<'a>(
    movements: impl IntoIterator<Item = &'a StockMovement>,
) -> BTreeMap<StockKey, i64> {
    let mut levels: BTreeMap<StockKey, i64> = BTreeMap::new();
    for m in movements {
        *levels.entry(m.key()).or_default() += m.signed_quantity();
    }
    levels.retain(|_, q| *q != 0);
    levels
}

/// Sum per-location quantities into per-product totals.
pub fn product_totals<'a>(
    levels: impl IntoIterator<Item = (&'a StockKey, &'a i64)>,
) -> BTreeMap<ProductId, i64> {
    let mut totals: BTreeMap<ProductId, i64> = BTreeMap::new();
    for (key, quantity) in levels {
        *totals.entry(key.product_id).or_default() += *quantity;
    }
    totals
}
