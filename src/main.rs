use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ctwallet::blind::{compute_closing_blind, ClosingSide};
use ctwallet::chain::MemoryChain;
use ctwallet::config;
use ctwallet::crypto::{verify_commitment, BlindingFactor, Commitment};
use ctwallet::metrics;
use ctwallet::records::{format_amount, parse_amount, OutputType};
use ctwallet::storage::{KvStore, Store};
use ctwallet::tracer;
use ctwallet::transaction::OutPoint;
use ctwallet::wallet::Wallet;

#[derive(Parser)]
#[command(author, version, about = "ctwallet: confidential-output wallet ledger tools")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Wallet name used in logs and trace reports
    #[arg(long, default_value = "default")]
    wallet: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List transaction records with their outputs
    Records,
    /// Owned balances per output kind
    Balance,
    /// Unspent owned outputs of one kind (plain, blind or anon)
    Unspent {
        #[arg(long, default_value = "blind")]
        kind: OutputType,
    },
    /// Check stored blinds against stored commitments
    Audit,
    /// Walk the provenance of frozen outputs back to plain inputs
    Trace {
        /// Outpoints as txid:n
        #[arg(required = true)]
        outpoints: Vec<String>,
    },
    /// Owned frozen outputs and whether each may be spent
    Frozen {
        /// Overrides [frozen] max_tainted_value_out, in coins
        #[arg(long)]
        max_value: Option<String>,
    },
    /// Mark a transaction abandoned and release its inputs
    Abandon { txid: String },
    /// Lock or unlock an outpoint against coin selection
    LockCoin {
        outpoint: String,
        #[arg(long, default_value_t = false)]
        unlock: bool,
    },
    /// Check that a commitment opens to (value, blind)
    VerifyCommitment {
        #[arg(long)]
        commitment: String,
        #[arg(long)]
        blind: String,
        #[arg(long)]
        value: u64,
    },
    /// Solve the output blind that balances the given blinds
    ClosingBlind {
        #[arg(long = "input", required = true)]
        inputs: Vec<String>,
        /// Fixed output blinds; the closing output is appended
        #[arg(long = "output")]
        outputs: Vec<String>,
    },
    /// Print counters in Prometheus text format
    Metrics,
}

fn parse_txid(s: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(s).with_context(|| format!("txid {} is not hex", s))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("txid {} is not 32 bytes", s))
}

fn open_wallet(cfg: &config::Config, name: &str, chain: &MemoryChain) -> anyhow::Result<Wallet> {
    let store: Arc<dyn KvStore> = Arc::new(
        Store::open(&cfg.storage.path).with_context(|| format!("opening wallet database {}", cfg.storage.path))?,
    );
    println!("🗄️  Database opened at '{}'", cfg.storage.path);
    Ok(Wallet::open(name, store, chain)?)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("⚠️  Could not read config from '{}': {:#}; using embedded defaults", &cli.config, e);
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            config::load_from_str(EMBEDDED_CONFIG)?
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // No node connection: chain state starts empty, so depths read as unconfirmed.
    let chain = MemoryChain::new(0);

    match cli.cmd {
        Cmd::Records => {
            let wallet = open_wallet(&cfg, &cli.wallet, &chain)?;
            for (txid, record) in wallet.records() {
                let status = if record.is_abandoned() {
                    "abandoned"
                } else if record.is_conflicted() {
                    "conflicted"
                } else if record.hash_unset() {
                    "unconfirmed"
                } else {
                    "confirmed"
                };
                println!(
                    "{} {:?} fee={} {} time={}",
                    hex::encode(txid),
                    record.input_type(),
                    format_amount(record.fee),
                    status,
                    record.tx_time()
                );
                for o in &record.outputs {
                    println!(
                        "    #{:<3} {:<5} {:>20} flags={:#04x} {}",
                        o.n,
                        o.output_type.to_string(),
                        format_amount(o.value),
                        o.flags,
                        o.narration
                    );
                }
            }
        }
        Cmd::Balance => {
            let wallet = open_wallet(&cfg, &cli.wallet, &chain)?;
            let b = wallet.balances(&chain);
            println!("💰 plain: {} (+{} unconfirmed)", format_amount(b.plain), format_amount(b.plain_unconfirmed));
            println!("💰 blind: {} (+{} unconfirmed)", format_amount(b.blind), format_amount(b.blind_unconfirmed));
            println!("💰 anon:  {} (+{} unconfirmed)", format_amount(b.anon), format_amount(b.anon_unconfirmed));
            if b.watch_only > 0 {
                println!("👀 watch-only: {}", format_amount(b.watch_only));
            }
        }
        Cmd::Unspent { kind } => {
            let wallet = open_wallet(&cfg, &cli.wallet, &chain)?;
            for u in wallet.list_unspent(kind, &chain) {
                println!(
                    "{} {} depth={}{}",
                    u.outpoint,
                    format_amount(u.value),
                    u.depth,
                    if u.is_change { " change" } else { "" }
                );
            }
        }
        Cmd::Audit => {
            let wallet = open_wallet(&cfg, &cli.wallet, &chain)?;
            let issues = wallet.audit_stored_blinds()?;
            if issues.is_empty() {
                println!("✅ All stored blinds reopen their commitments");
            }
            for issue in &issues {
                println!("❌ {}", issue);
            }
        }
        Cmd::Trace { outpoints } => {
            let frozen = outpoints
                .iter()
                .map(|s| s.parse::<OutPoint>())
                .collect::<Result<Vec<_>, _>>()?;
            let handle = open_wallet(&cfg, &cli.wallet, &chain)?.into_handle();
            let report = tracer::trace_frozen_outputs(&[handle], &chain, &frozen)?;
            for node in report.nodes.values() {
                println!(
                    "{} {:?} inputs={} outputs={}{}",
                    hex::encode(node.txid),
                    node.input_type,
                    node.inputs.len(),
                    node.outputs.len(),
                    if node.found { "" } else { " (not in wallet)" }
                );
            }
            for w in &report.warnings {
                println!("⚠️  {}", w);
            }
            println!(
                "traced {} from {} plain origins, unexplained {}",
                format_amount(report.total_traced_value),
                report.plain_origins.len(),
                format_amount(report.unexplained_value)
            );
        }
        Cmd::Frozen { max_value } => {
            let threshold = match max_value {
                Some(v) => parse_amount(&v)?,
                None => cfg.frozen.max_tainted_value_out,
            };
            let handle = open_wallet(&cfg, &cli.wallet, &chain)?.into_handle();
            let frozen = tracer::list_frozen_outputs(&[handle], &chain, threshold)?;
            if frozen.is_empty() {
                println!("✅ No frozen outputs");
            }
            for f in &frozen {
                println!(
                    "{} {} {}{}{} {}",
                    f.outpoint,
                    f.output_type,
                    format_amount(f.value),
                    if f.whitelisted { " whitelisted" } else { "" },
                    if f.blacklisted { " blacklisted" } else { "" },
                    if f.spendable { "🟢 spendable" } else { "🔴 not spendable" }
                );
            }
        }
        Cmd::Abandon { txid } => {
            let txid = parse_txid(&txid)?;
            let mut wallet = open_wallet(&cfg, &cli.wallet, &chain)?;
            wallet.abandon_transaction(&txid)?;
            println!("✅ Abandoned {}", hex::encode(txid));
        }
        Cmd::LockCoin { outpoint, unlock } => {
            let op: OutPoint = outpoint.parse()?;
            let mut wallet = open_wallet(&cfg, &cli.wallet, &chain)?;
            if unlock {
                wallet.unlock_coin(&op)?;
                println!("🔓 Unlocked {}", op);
            } else {
                wallet.lock_coin(op)?;
                println!("🔒 Locked {}", op);
            }
        }
        Cmd::VerifyCommitment { commitment, blind, value } => {
            let commitment = Commitment::from_hex(&commitment)?;
            let blind = BlindingFactor::from_hex(&blind)?;
            if verify_commitment(&commitment, &blind, value) {
                println!("✅ Commitment opens to {}", value);
            } else {
                anyhow::bail!("commitment does not open to {}", value);
            }
        }
        Cmd::ClosingBlind { inputs, outputs } => {
            let inputs = inputs
                .iter()
                .map(|h| BlindingFactor::from_hex(h))
                .collect::<Result<Vec<_>, _>>()?;
            let mut outputs = outputs
                .iter()
                .map(|h| BlindingFactor::from_hex(h))
                .collect::<Result<Vec<_>, _>>()?;
            outputs.push(BlindingFactor::zero());
            let closing = compute_closing_blind(&inputs, &outputs, ClosingSide::Output)?;
            println!("{}", hex::encode(closing.as_bytes()));
        }
        Cmd::Metrics => {
            print!("{}", metrics::encode_text()?);
        }
    }

    Ok(())
}
