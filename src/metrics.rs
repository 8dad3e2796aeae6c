use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static metric name is valid");
    if let Err(e) = REGISTRY.register(Box::new(c.clone())) {
        tracing::warn!(metric = name, "could not register metric: {}", e);
    }
    c
}

pub static SELECTION_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("ctwallet_selection_failures_total", "Coin selections that could not cover the target"));
pub static MIXIN_SHORTAGES: Lazy<IntCounter> =
    Lazy::new(|| counter("ctwallet_mixin_shortages_total", "Ring builds that ran out of eligible decoys"));
pub static DB_TXN_ABORTS: Lazy<IntCounter> =
    Lazy::new(|| counter("ctwallet_db_txn_aborts_total", "Database transactions aborted before commit"));
pub static TRACED_TRANSACTIONS: Lazy<IntCounter> =
    Lazy::new(|| counter("ctwallet_traced_transactions_total", "Transactions visited by frozen output traces"));
pub static TRACE_WARNINGS: Lazy<IntCounter> =
    Lazy::new(|| counter("ctwallet_trace_warnings_total", "Warnings raised while tracing frozen outputs"));

/// Touch every counter so it shows up in the output even at zero.
pub fn init() {
    Lazy::force(&SELECTION_FAILURES);
    Lazy::force(&MIXIN_SHORTAGES);
    Lazy::force(&DB_TXN_ABORTS);
    Lazy::force(&TRACED_TRANSACTIONS);
    Lazy::force(&TRACE_WARNINGS);
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_text() -> Result<String> {
    init();
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
