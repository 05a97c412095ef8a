//! Event contracts and in-process publication.
//!
//! Batch events are published here only after the ledger commit that produced
//! them has succeeded; consumers (reporting, exports) treat them as read-only
//! notifications and go back to the store for authoritative figures.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
