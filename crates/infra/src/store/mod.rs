//! Transactional ledger store boundary.
//!
//! Batches, the movement ledger, stock levels and product totals live behind
//! one trait so every mutation can be submitted as a single atomic
//! [`ChangeSet`] carrying its own optimistic expectations.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use r#trait::{
    BatchWrite, ChangeSet, LedgerSnapshot, LedgerStore, LocationKind, LocationRecord,
    ProductRecord, ProductTotalWrite, PurgeBatch, StockLevelWrite, StoreError,
};
