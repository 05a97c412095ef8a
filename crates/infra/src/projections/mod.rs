//! Materialized projections of the movement ledger.
//!
//! Both are rebuildable from the ledger alone; see `reconciliation`.

pub mod product_totals;
pub mod stock_levels;

pub use product_totals::ProductAggregator;
pub use stock_levels::{LevelChange, LevelPlan, StockLevelProjector};
