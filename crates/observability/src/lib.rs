//! Process-wide logging setup shared by the ledger binaries.

/// Initialize structured logging with the default `info` filter.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    tracing::init("info");
}

/// Like [`init`], with a caller-chosen default directive (`RUST_LOG` still wins).
pub fn init_with_default(directive: &str) {
    tracing::init(directive);
}

/// Subscriber construction (filters, JSON formatting).
pub mod tracing;
