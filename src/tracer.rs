//! Provenance tracing of frozen blinded and anonymous outputs.
//!
//! Starting from a set of frozen outpoints, the tracer walks transaction
//! inputs backwards across every loaded wallet until it reaches transactions
//! funded by plain inputs. Each transaction id is expanded at most once, so
//! corrupt records that reference each other still terminate. Missing data is
//! reported as warnings and the walk continues.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::chain::ChainView;
use crate::error::{Result, WalletError};
use crate::records::{Amount, OutputType, StoredTransaction, TransactionRecord, Txid, UNKNOWN_VALUE};
use crate::selection::frozen_spendable;
use crate::transaction::OutPoint;
use crate::wallet::{Wallet, WalletHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceWarningKind {
    MissingRecord,
    MissingStoredTransaction,
    UnreadableStoredTransaction,
    MissingBlind,
    MissingAnonIndex,
    MissingKeyImage,
    UnresolvedValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceWarning {
    pub kind: TraceWarningKind,
    pub txid: Txid,
    pub n: Option<u32>,
    pub message: String,
}

impl std::fmt::Display for TraceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.n {
            Some(n) => write!(f, "{}:{}: {}", hex::encode(self.txid), n, self.message),
            None => write!(f, "{}: {}", hex::encode(self.txid), self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedOutput {
    pub n: u32,
    pub output_type: OutputType,
    pub value: Amount,
    pub anon_index: Option<i64>,
    pub blind_known: bool,
    pub spent: bool,
    pub spent_by: Option<Txid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedTx {
    pub txid: Txid,
    /// False when no loaded wallet has a record for this transaction.
    pub found: bool,
    pub input_type: OutputType,
    pub wallets: Vec<String>,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TracedOutput>,
    pub fee: Amount,
}

impl TracedTx {
    fn missing(txid: Txid) -> Self {
        TracedTx {
            txid,
            found: false,
            input_type: OutputType::Standard,
            wallets: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            fee: 0,
        }
    }

    /// Plain value converted into shielded outputs here. Plain change and
    /// the fee never enter the shielded graph.
    fn plain_input_value(&self) -> Amount {
        if !self.found || self.input_type != OutputType::Standard {
            return 0;
        }
        self.outputs
            .iter()
            .filter(|o| o.output_type != OutputType::Standard && o.value != UNKNOWN_VALUE)
            .map(|o| o.value)
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceReport {
    pub roots: Vec<OutPoint>,
    pub nodes: BTreeMap<Txid, TracedTx>,
    pub warnings: Vec<TraceWarning>,
    /// Plain inputs that funded the traced graph.
    pub plain_origins: Vec<OutPoint>,
    /// Shielded value created by plain-funded transactions.
    pub plain_value: Amount,
    /// Resolved value of the frozen roots.
    pub total_traced_value: Amount,
    /// Frozen value not covered by plain inputs.
    pub unexplained_value: Amount,
}

fn lock(handle: &WalletHandle) -> Result<MutexGuard<'_, Wallet>> {
    handle
        .lock()
        .map_err(|_| WalletError::Persistence("wallet mutex poisoned".into()))
}

/// What one wallet knows about a transaction, read under its lock.
struct WalletView {
    wallet: String,
    record: TransactionRecord,
    stored: std::result::Result<Option<StoredTransaction>, String>,
    spent_by: BTreeMap<u16, Txid>,
}

fn read_views(wallets: &[WalletHandle], txid: &Txid) -> Result<Vec<WalletView>> {
    let mut views = Vec::new();
    for handle in wallets {
        let wallet = lock(handle)?;
        if wallet.is_locked() {
            return Err(WalletError::WalletLocked(wallet.name().to_string()));
        }
        let Some(record) = wallet.record(txid) else {
            continue;
        };
        let spent_by = record
            .outputs
            .iter()
            .filter_map(|o| wallet.spent_by(&OutPoint::new(*txid, o.n as u32)).map(|s| (o.n, s)))
            .collect();
        views.push(WalletView {
            wallet: wallet.name().to_string(),
            record: record.clone(),
            stored: wallet.stored_transaction(txid).map_err(|e| e.to_string()),
            spent_by,
        });
        // guard dropped here; wallets are never held together
    }
    Ok(views)
}

fn expand_tx(txid: Txid, views: Vec<WalletView>, chain: &dyn ChainView, warnings: &mut Vec<TraceWarning>) -> TracedTx {
    if views.is_empty() {
        warnings.push(TraceWarning {
            kind: TraceWarningKind::MissingRecord,
            txid,
            n: None,
            message: "no loaded wallet has a record for this transaction".into(),
        });
        return TracedTx::missing(txid);
    }

    let mut node = TracedTx::missing(txid);
    node.found = true;
    node.input_type = views[0].record.input_type();
    node.fee = views[0].record.fee;

    let mut inputs: BTreeSet<OutPoint> = BTreeSet::new();
    let mut outputs: BTreeMap<u32, TracedOutput> = BTreeMap::new();
    let mut stored: Option<StoredTransaction> = None;
    for view in &views {
        node.wallets.push(view.wallet.clone());
        inputs.extend(view.record.inputs.iter().copied());
        match &view.stored {
            Ok(Some(s)) => {
                if stored.is_none() {
                    stored = Some(s.clone());
                }
            }
            Ok(None) => {}
            Err(e) => warnings.push(TraceWarning {
                kind: TraceWarningKind::UnreadableStoredTransaction,
                txid,
                n: None,
                message: format!("wallet {}: {}", view.wallet, e),
            }),
        }
        for o in &view.record.outputs {
            let entry = outputs.entry(o.n as u32).or_insert(TracedOutput {
                n: o.n as u32,
                output_type: o.output_type,
                value: o.value,
                anon_index: None,
                blind_known: false,
                spent: false,
                spent_by: None,
            });
            if entry.value == UNKNOWN_VALUE {
                entry.value = o.value;
            }
            entry.spent |= o.is_spent();
            if let Some(s) = view.spent_by.get(&o.n) {
                entry.spent = true;
                entry.spent_by = Some(*s);
            }
        }
    }

    let has_shielded = outputs.values().any(|o| o.output_type != OutputType::Standard);
    if stored.is_none() && has_shielded {
        warnings.push(TraceWarning {
            kind: TraceWarningKind::MissingStoredTransaction,
            txid,
            n: None,
            message: "stored transaction not found".into(),
        });
    }

    for out in outputs.values_mut() {
        if out.value == UNKNOWN_VALUE {
            warnings.push(TraceWarning {
                kind: TraceWarningKind::UnresolvedValue,
                txid,
                n: Some(out.n),
                message: "output value could not be recovered".into(),
            });
        }
        if out.output_type == OutputType::Standard {
            continue;
        }
        let Some(stx) = stored.as_ref() else {
            continue;
        };
        out.blind_known = stx.get_blind(out.n).is_some();
        if !out.blind_known {
            warnings.push(TraceWarning {
                kind: TraceWarningKind::MissingBlind,
                txid,
                n: Some(out.n),
                message: "blinding factor not stored".into(),
            });
        }
        if out.output_type == OutputType::Anon {
            out.anon_index = stx.get_anon_pubkey(out.n).and_then(|pk| chain.read_rct_output_link(&pk));
            if out.anon_index.is_none() {
                warnings.push(TraceWarning {
                    kind: TraceWarningKind::MissingAnonIndex,
                    txid,
                    n: Some(out.n),
                    message: "anonymous output index link unreadable".into(),
                });
            }
            if out.spent_by.is_none() {
                match stx.get_key_image(out.n) {
                    Some(key_image) => {
                        if let Some(spender) = chain.read_rct_key_image(key_image) {
                            out.spent = true;
                            out.spent_by = Some(spender);
                        }
                    }
                    None => warnings.push(TraceWarning {
                        kind: TraceWarningKind::MissingKeyImage,
                        txid,
                        n: Some(out.n),
                        message: "key image unknown, on-chain spend state not checked".into(),
                    }),
                }
            }
        }
    }

    node.inputs = inputs.into_iter().collect();
    node.outputs = outputs.into_values().collect();
    node
}

/// Walks back from `frozen` across every wallet in `wallets`.
///
/// Fails with `WalletLocked` before any work if a wallet is locked. Each
/// wallet's mutex is taken on its own and released before the next.
pub fn trace_frozen_outputs(
    wallets: &[WalletHandle],
    chain: &dyn ChainView,
    frozen: &[OutPoint],
) -> Result<TraceReport> {
    for handle in wallets {
        let wallet = lock(handle)?;
        if wallet.is_locked() {
            warn!(wallet = wallet.name(), "trace aborted: wallet is locked");
            return Err(WalletError::WalletLocked(wallet.name().to_string()));
        }
    }

    let mut report = TraceReport { roots: frozen.to_vec(), ..Default::default() };
    let mut visited: BTreeMap<Txid, TracedTx> = BTreeMap::new();
    let mut stack: Vec<Txid> = frozen.iter().rev().map(|op| op.txid).collect();

    while let Some(txid) = stack.pop() {
        if visited.contains_key(&txid) {
            continue;
        }
        let views = read_views(wallets, &txid)?;
        let node = expand_tx(txid, views, chain, &mut report.warnings);
        debug!(txid = %hex::encode(txid), inputs = node.inputs.len(), found = node.found, "traced transaction");
        if node.found {
            if node.input_type == OutputType::Standard {
                report.plain_origins.extend(node.inputs.iter().copied());
            } else {
                for input in node.inputs.iter().rev() {
                    if !visited.contains_key(&input.txid) {
                        stack.push(input.txid);
                    }
                }
            }
        }
        visited.insert(txid, node);
    }

    for root in frozen {
        let value = visited
            .get(&root.txid)
            .and_then(|tx| tx.outputs.iter().find(|o| o.n == root.n))
            .map(|o| o.value);
        match value {
            Some(v) if v != UNKNOWN_VALUE => report.total_traced_value += v,
            Some(_) => {}
            None => {
                if visited.get(&root.txid).map(|t| t.found).unwrap_or(false) {
                    report.warnings.push(TraceWarning {
                        kind: TraceWarningKind::MissingRecord,
                        txid: root.txid,
                        n: Some(root.n),
                        message: "frozen output not present in its transaction record".into(),
                    });
                }
            }
        }
    }
    report.plain_value = visited.values().map(|t| t.plain_input_value()).sum();
    report.unexplained_value = (report.total_traced_value - report.plain_value).max(0);
    report.nodes = visited;

    crate::metrics::TRACED_TRANSACTIONS.inc_by(report.nodes.len() as u64);
    crate::metrics::TRACE_WARNINGS.inc_by(report.warnings.len() as u64);
    info!(
        roots = frozen.len(),
        nodes = report.nodes.len(),
        warnings = report.warnings.len(),
        unexplained = report.unexplained_value,
        "frozen output trace finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenOutput {
    pub wallet: String,
    pub outpoint: OutPoint,
    pub output_type: OutputType,
    pub value: Amount,
    pub anon_index: Option<i64>,
    pub whitelisted: bool,
    pub blacklisted: bool,
    pub spendable: bool,
}

/// Every unspent owned shielded output the chain marks frozen, with its
/// spendability under `max_tainted_value_out`.
pub fn list_frozen_outputs(
    wallets: &[WalletHandle],
    chain: &dyn ChainView,
    max_tainted_value_out: Amount,
) -> Result<Vec<FrozenOutput>> {
    let mut out = Vec::new();
    for handle in wallets {
        let wallet = lock(handle)?;
        for (txid, record) in wallet.records() {
            let stored = if record.outputs.iter().any(|o| o.output_type == OutputType::Anon) {
                wallet.stored_transaction(txid)?
            } else {
                None
            };
            for o in &record.outputs {
                if !o.is_owned() || o.is_spent() || o.is_placeholder() {
                    continue;
                }
                let outpoint = OutPoint::new(*txid, o.n as u32);
                if wallet.spent_by(&outpoint).is_some() {
                    continue;
                }
                let (frozen, whitelisted, blacklisted, anon_index) = match o.output_type {
                    OutputType::Standard => continue,
                    OutputType::Blind => (
                        chain.is_frozen_blind_output(txid),
                        chain.is_whitelisted_blind_output(&outpoint),
                        false,
                        None,
                    ),
                    OutputType::Anon => {
                        let Some(index) = stored
                            .as_ref()
                            .and_then(|s| s.get_anon_pubkey(o.n as u32))
                            .and_then(|pk| chain.read_rct_output_link(&pk))
                        else {
                            continue;
                        };
                        let key_image = stored.as_ref().and_then(|s| s.get_key_image(o.n as u32));
                        if key_image.and_then(|ki| chain.read_rct_key_image(ki)).is_some() {
                            continue;
                        }
                        (
                            chain.is_frozen_anon_output(index),
                            chain.is_whitelisted_anon_output(index),
                            chain.is_blacklisted_anon_output(index),
                            Some(index),
                        )
                    }
                };
                if !frozen {
                    continue;
                }
                out.push(FrozenOutput {
                    wallet: wallet.name().to_string(),
                    outpoint,
                    output_type: o.output_type,
                    value: o.value,
                    anon_index,
                    whitelisted,
                    blacklisted,
                    // an unresolved value cannot be checked against the limit
                    spendable: o.value != UNKNOWN_VALUE
                        && frozen_spendable(whitelisted, blacklisted, o.value, max_tainted_value_out),
                });
            }
        }
    }
    Ok(out)
}
