//! `batchledger-core`: ids, aggregate contract and domain errors.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, AuditEntryId, LocationId, MovementId, ProductId, UserId};
