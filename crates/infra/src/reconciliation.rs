//! Drift detection between the movement ledger and its projections.
//!
//! The ledger is authoritative. A reconciliation run re-derives every stock
//! level and product total from it, reports each mismatch to a
//! [`DriftAlertSink`], and optionally overwrites the stored projections.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use batchledger_core::ProductId;
use batchledger_events::EventBus;
use batchledger_inventory::{
    AuditAction, AuditEntry, EntityKind, EntityRef, StockKey, derive_levels, product_totals,
};

use crate::audit::AuditTrail;
use crate::command_dispatcher::{BatchEnvelope, with_retry};
use crate::config::{LedgerConfig, MIN_RECONCILIATION_INTERVAL};
use crate::error::LedgerResult;
use crate::ledger::BatchLedger;
use crate::store::{ChangeSet, LedgerSnapshot, LedgerStore, ProductTotalWrite, StockLevelWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDrift {
    pub key: StockKey,
    pub recorded: i64,
    pub derived: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalDrift {
    pub product_id: ProductId,
    pub recorded: i64,
    pub derived: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub checked_at: DateTime<Utc>,
    pub movements_scanned: usize,
    pub level_drift: Vec<LevelDrift>,
    pub total_drift: Vec<TotalDrift>,
    /// Stored projections were overwritten from the ledger.
    pub repaired: bool,
    /// Levels the repair could not write (negative derived quantity or
    /// unknown product/location).
    pub unrepairable: Vec<StockKey>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.level_drift.is_empty() && self.total_drift.is_empty()
    }

    pub fn drift_count(&self) -> usize {
        self.level_drift.len() + self.total_drift.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftAlert {
    Level(LevelDrift),
    Total(TotalDrift),
}

/// Receives one alert per mismatch found.
pub trait DriftAlertSink: Send + Sync {
    fn alert(&self, alert: &DriftAlert);
}

/// Default sink: every alert is an `error` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDriftAlertSink;

impl DriftAlertSink for LoggingDriftAlertSink {
    fn alert(&self, alert: &DriftAlert) {
        match alert {
            DriftAlert::Level(d) => error!(
                product_id = %d.key.product_id,
                location_id = %d.key.location_id,
                recorded = d.recorded,
                derived = d.derived,
                "stock level drifted from ledger"
            ),
            DriftAlert::Total(d) => error!(
                product_id = %d.product_id,
                recorded = d.recorded,
                derived = d.derived,
                "product total drifted from ledger"
            ),
        }
    }
}

/// Collects alerts for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDriftAlertSink {
    alerts: Mutex<Vec<DriftAlert>>,
}

impl InMemoryDriftAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<DriftAlert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl DriftAlertSink for InMemoryDriftAlertSink {
    fn alert(&self, alert: &DriftAlert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(*alert);
        }
    }
}

/// Compare stored projections in `snapshot` with what its ledger implies.
pub fn detect_drift(snapshot: &LedgerSnapshot) -> (Vec<LevelDrift>, Vec<TotalDrift>) {
    let derived = derive_levels(&snapshot.movements);
    let recorded: BTreeMap<StockKey, i64> = snapshot
        .stock_levels
        .iter()
        .map(|l| (l.key(), l.quantity))
        .collect();

    let keys: BTreeSet<StockKey> = derived.keys().chain(recorded.keys()).copied().collect();
    let level_drift = keys
        .into_iter()
        .filter_map(|key| {
            let recorded = recorded.get(&key).copied().unwrap_or(0);
            let derived = derived.get(&key).copied().unwrap_or(0);
            (recorded != derived).then_some(LevelDrift {
                key,
                recorded,
                derived,
            })
        })
        .collect();

    let derived_totals = product_totals(&derived);
    let total_drift = snapshot
        .products
        .iter()
        .filter_map(|p| {
            let derived = derived_totals.get(&p.product_id).copied().unwrap_or(0);
            (p.stock_quantity != derived).then_some(TotalDrift {
                product_id: p.product_id,
                recorded: p.stock_quantity,
                derived,
            })
        })
        .collect();

    (level_drift, total_drift)
}

pub struct Reconciler<'a, S, A, B> {
    ledger: &'a BatchLedger<S, A, B>,
}

impl<'a, S, A, B> Reconciler<'a, S, A, B>
where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    pub(crate) fn new(ledger: &'a BatchLedger<S, A, B>) -> Self {
        Self { ledger }
    }

    /// Reconcile, logging alerts through [`LoggingDriftAlertSink`].
    pub fn run(&self, repair: bool) -> LedgerResult<ReconciliationReport> {
        self.run_with_sink(repair, &LoggingDriftAlertSink)
    }

    pub fn run_with_sink(
        &self,
        repair: bool,
        sink: &dyn DriftAlertSink,
    ) -> LedgerResult<ReconciliationReport> {
        let report = with_retry(self.ledger.config().retry, "reconcile", "stock ledger", |_| {
            let snapshot = self.ledger.store().snapshot()?;
            let (level_drift, total_drift) = detect_drift(&snapshot);
            let mut report = ReconciliationReport {
                checked_at: Utc::now(),
                movements_scanned: snapshot.movements.len(),
                level_drift,
                total_drift,
                repaired: false,
                unrepairable: Vec::new(),
            };
            if repair && !report.is_clean() {
                report.unrepairable = self.repair(&snapshot, &report)?;
                report.repaired = true;
            }
            Ok(report)
        })?;

        if report.is_clean() {
            debug!(movements = report.movements_scanned, "ledger reconciled clean");
            return Ok(report);
        }

        for d in &report.level_drift {
            sink.alert(&DriftAlert::Level(*d));
        }
        for d in &report.total_drift {
            sink.alert(&DriftAlert::Total(*d));
        }
        warn!(
            level_drift = report.level_drift.len(),
            total_drift = report.total_drift.len(),
            repaired = report.repaired,
            unrepairable = report.unrepairable.len(),
            "ledger drift detected"
        );
        if report.repaired {
            self.ledger.audit(
                AuditEntry::new(
                    AuditAction::StockReconciled,
                    EntityRef::new(EntityKind::Ledger, "stock"),
                    report.checked_at,
                )
                .with_after(&report)
                .with_notes(format!("repaired {} drifted values", report.drift_count())),
            );
        }
        Ok(report)
    }

    /// Overwrite drifted levels with derived values and recompute affected
    /// totals, all in one commit. Returns the keys that could not be written.
    fn repair(
        &self,
        snapshot: &LedgerSnapshot,
        report: &ReconciliationReport,
    ) -> LedgerResult<Vec<StockKey>> {
        let known_products: BTreeSet<ProductId> =
            snapshot.products.iter().map(|p| p.product_id).collect();
        let known_locations: BTreeSet<_> =
            snapshot.locations.iter().map(|l| l.location_id).collect();

        let now = Utc::now();
        let mut changes = ChangeSet::new();
        let mut unrepairable = Vec::new();
        let mut touched: BTreeSet<ProductId> = BTreeSet::new();

        for d in &report.level_drift {
            let known = known_products.contains(&d.key.product_id)
                && known_locations.contains(&d.key.location_id);
            if d.derived < 0 || !known {
                unrepairable.push(d.key);
                continue;
            }
            changes.push_level(StockLevelWrite {
                key: d.key,
                expected: d.recorded,
                new_quantity: d.derived,
                at: now,
            });
            touched.insert(d.key.product_id);
        }
        for d in &report.total_drift {
            touched.insert(d.product_id);
        }
        for product_id in touched.into_iter().filter(|p| known_products.contains(p)) {
            changes.push_total(ProductTotalWrite::Recompute(product_id));
        }

        self.ledger.store().commit(changes)?;
        for key in &unrepairable {
            warn!(product_id = %key.product_id, location_id = %key.location_id, "drifted level left unrepaired");
        }
        Ok(unrepairable)
    }
}

/// Periodic reconciliation on a background thread.
#[derive(Debug, Clone)]
pub struct ReconciliationRunner {
    pub interval: Duration,
    pub repair: bool,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for ReconciliationRunner {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

/// Handle for a running reconciliation thread.
#[derive(Debug)]
pub struct ReconciliationRunnerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    completed: Arc<AtomicU64>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReconciliationRunnerHandle {
    /// Request a run now. Triggers coalesce while one is already pending.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Runs finished successfully since spawn.
    pub fn completed_runs(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl ReconciliationRunner {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            interval: config.reconciliation_interval,
            repair: config.reconciliation_repair,
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }

    /// Spawn the runner thread.
    ///
    /// - Schedule: once on startup, then every `interval` (at least
    ///   [`MIN_RECONCILIATION_INTERVAL`])
    /// - Trigger: `handle.trigger()` requests an extra run
    /// - Failures: logged and retried with bounded exponential backoff; never propagate
    pub fn spawn<S, A, B>(
        &self,
        name: &'static str,
        ledger: Arc<BatchLedger<S, A, B>>,
        sink: Arc<dyn DriftAlertSink>,
    ) -> std::io::Result<ReconciliationRunnerHandle>
    where
        S: LedgerStore + 'static,
        A: AuditTrail + 'static,
        B: EventBus<BatchEnvelope> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let completed = Arc::new(AtomicU64::new(0));

        let mut cfg = self.clone();
        cfg.interval = cfg.interval.max(MIN_RECONCILIATION_INTERVAL);
        let counter = completed.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner_loop(name, cfg, shutdown_rx, trigger_rx, ledger, sink, counter))?;

        Ok(ReconciliationRunnerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            completed,
            join: Some(join),
        })
    }
}

fn runner_loop<S, A, B>(
    name: &'static str,
    cfg: ReconciliationRunner,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    ledger: Arc<BatchLedger<S, A, B>>,
    sink: Arc<dyn DriftAlertSink>,
    completed: Arc<AtomicU64>,
) where
    S: LedgerStore,
    A: AuditTrail,
    B: EventBus<BatchEnvelope>,
{
    info!(runner = name, interval_ms = cfg.interval.as_millis() as u64, repair = cfg.repair, "reconciliation runner started");

    let mut next_tick = Instant::now() + cfg.interval;
    let mut pending = true;
    let mut failures: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            while next_tick <= now {
                next_tick += cfg.interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if let Some(until) = backoff_until {
            if Instant::now() < until {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            backoff_until = None;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(50));
            thread::sleep(sleep_for);
            continue;
        }
        pending = false;

        match ledger.reconciler().run_with_sink(cfg.repair, sink.as_ref()) {
            Ok(report) => {
                failures = 0;
                completed.fetch_add(1, Ordering::SeqCst);
                debug!(runner = name, drift = report.drift_count(), "reconciliation run finished");
            }
            Err(e) => {
                warn!(runner = name, error = %e, "reconciliation run failed");
                failures += 1;
                if failures <= cfg.max_retries {
                    pending = true;
                    backoff_until = Some(Instant::now() + backoff(cfg.base_backoff, failures));
                } else {
                    failures = 0;
                }
            }
        }
    }

    info!(runner = name, "reconciliation runner stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}
