//! Command execution helpers shared by every mutating component.
//!
//! Unlike a plain event-sourced dispatcher, a batch command never commits on
//! its own: the decided batch state travels in the same [`ChangeSet`] as the
//! ledger rows and projection writes it implies. This module provides the
//! three pieces every component combines:
//!
//! 1. [`decide`]: run a command against a batch snapshot (pure, no mutation
//!    of the snapshot) and return the evolved state with its events.
//! 2. [`with_retry`]: re-read, re-plan and re-commit while the store reports
//!    optimistic concurrency failures, up to the configured attempt budget.
//! 3. [`publish_committed`]: publish events only after their commit succeeded.
//!
//! [`ChangeSet`]: crate::store::ChangeSet

use std::thread;

use tracing::{debug, warn};
use uuid::Uuid;

use batchledger_core::{Aggregate, AggregateRoot};
use batchledger_events::{Event, EventBus, EventEnvelope};
use batchledger_inventory::{Batch, BatchCommand, BatchEvent, BatchId};

use crate::config::RetryPolicy;
use crate::error::{LedgerError, LedgerResult};

/// Aggregate type of published batch envelopes.
pub const BATCH_AGGREGATE_TYPE: &str = "inventory.batch";

/// Published batch event.
pub type BatchEnvelope = EventEnvelope<BatchEvent>;

/// Outcome of running one command against a batch snapshot.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Version of the snapshot the command ran against.
    pub base_version: u64,
    pub batch: Batch,
    pub events: Vec<BatchEvent>,
}

impl Decision {
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// Handle `command` against `current` and apply the resulting events to a copy.
pub fn decide(current: &Batch, command: BatchCommand) -> LedgerResult<Decision> {
    let events = current.handle(&command)?;
    let mut batch = current.clone();
    for event in &events {
        batch.apply(event);
    }
    Ok(Decision {
        base_version: current.version(),
        batch,
        events,
    })
}

/// Run `attempt` until it succeeds, fails for a non-retryable reason, or the
/// policy's attempt budget is spent.
///
/// Each call of `attempt` must re-read whatever state it plans against; the
/// closure receives the 1-based attempt number for logging.
pub fn with_retry<T>(
    policy: RetryPolicy,
    operation: &'static str,
    subject: impl core::fmt::Display,
    mut attempt: impl FnMut(u32) -> LedgerResult<T>,
) -> LedgerResult<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n) {
            Err(err) if err.is_retryable() => {
                if n >= max_attempts {
                    warn!(operation, subject = %subject, attempts = n, error = %err, "optimistic retries exhausted");
                    return Err(LedgerError::ConcurrencyConflict {
                        operation,
                        subject: subject.to_string(),
                        attempts: n,
                    });
                }
                debug!(operation, subject = %subject, attempt = n, error = %err, "commit conflicted; retrying");
                let delay = policy.delay_after(n);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                n += 1;
            }
            other => return other,
        }
    }
}

/// Publish events of a committed decision.
///
/// The ledger change is already durable, so a bus failure is logged and
/// otherwise ignored.
pub fn publish_committed<B>(bus: &B, batch_id: BatchId, base_version: u64, events: &[BatchEvent])
where
    B: EventBus<BatchEnvelope>,
{
    for (idx, event) in events.iter().enumerate() {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            batch_id.0,
            BATCH_AGGREGATE_TYPE,
            event.event_type(),
            base_version + idx as u64 + 1,
            event.occurred_at(),
            event.clone(),
        );
        if let Err(err) = bus.publish(envelope) {
            warn!(
                batch_id = %batch_id,
                event_type = event.event_type(),
                error = ?err,
                "failed to publish committed batch event"
            );
        }
    }
}
