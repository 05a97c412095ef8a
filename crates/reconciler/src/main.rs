//! Offline drift check over an exported ledger snapshot.
//!
//! Usage: `batchledger-reconciler <snapshot.json> [--repair] [--output <path>]`
//!
//! Prints the reconciliation report as JSON. Exits with status 2 when drift
//! remains after the run.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};

use batchledger_events::InMemoryEventBus;
use batchledger_infra::{
    BatchLedger, InMemoryAuditTrail, InMemoryLedgerStore, LedgerConfig, LedgerSnapshot, LedgerStore,
};

struct Args {
    snapshot: PathBuf,
    repair: bool,
    output: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>, repair_default: bool) -> anyhow::Result<Args> {
    let mut snapshot = None;
    let mut repair = repair_default;
    let mut output = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--repair" => repair = true,
            "--output" => {
                let path = args.next().context("--output needs a path")?;
                output = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            path => {
                if snapshot.replace(PathBuf::from(path)).is_some() {
                    bail!("only one snapshot path may be given");
                }
            }
        }
    }
    let snapshot = snapshot.context("usage: batchledger-reconciler <snapshot.json> [--repair] [--output <path>]")?;
    if output.is_some() && !repair {
        bail!("--output only makes sense with --repair");
    }
    Ok(Args {
        snapshot,
        repair,
        output,
    })
}

fn run() -> anyhow::Result<ExitCode> {
    let config = LedgerConfig::from_env();
    let args = parse_args(std::env::args().skip(1), config.reconciliation_repair)?;

    let raw = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("reading {}", args.snapshot.display()))?;
    let snapshot: LedgerSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.snapshot.display()))?;
    let store = InMemoryLedgerStore::from_snapshot(snapshot).context("loading snapshot")?;

    let ledger = BatchLedger::new(store, InMemoryAuditTrail::new(), InMemoryEventBus::new(), config);
    let report = ledger.reconciler().run(args.repair)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(path) = &args.output {
        let repaired = serde_json::to_string_pretty(&ledger.store().snapshot()?)?;
        std::fs::write(path, repaired).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "repaired snapshot written");
    }

    let remaining = if report.repaired {
        report.unrepairable.len()
    } else {
        report.drift_count()
    };
    if remaining > 0 {
        tracing::warn!(remaining, "ledger drift remains");
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    batchledger_observability::init();

    match run() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("reconciliation failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
