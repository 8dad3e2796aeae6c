//! Coin selection across plain, blinded and anonymous outputs, and decoy
//! selection for ring signatures.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::chain::ChainView;
use crate::coin_control::{CoinControl, MixinSelectionMode};
use crate::config::{Frozen, WalletSettings};
use crate::crypto::{BlindingFactor, Commitment, CompressedPubKey};
use crate::error::{Result, WalletError};
use crate::records::{Amount, OutputType, ORF_LOCKED, UNKNOWN_VALUE};
use crate::transaction::OutPoint;
use crate::wallet::Wallet;

/// Pools no larger than this are enumerated exactly; larger ones are sampled.
const EXACT_POOL_LIMIT: i64 = 200_000;
const SAMPLE_ATTEMPTS_PER_DECOY: usize = 64;

/// An output that passed the eligibility filters.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub outpoint: OutPoint,
    pub output_type: OutputType,
    pub value: Amount,
    pub depth: i32,
    pub script: Vec<u8>,
    pub flags: u8,
    pub anon_index: Option<i64>,
}

/// An input chosen to fund a transaction, with what the builder needs to
/// spend it.
#[derive(Debug, Clone)]
pub struct SelectedCoin {
    pub outpoint: OutPoint,
    pub output_type: OutputType,
    pub value: Amount,
    pub blind: BlindingFactor,
    pub commitment: Option<Commitment>,
    pub pubkey: Option<CompressedPubKey>,
    pub anon_index: Option<i64>,
    /// Supplied through `CoinControl::input_data` rather than the ledger.
    pub external: bool,
    /// Known key image of an anonymous input.
    pub key_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub coins: Vec<SelectedCoin>,
    pub total: Amount,
}

/// Whether a frozen output may be spent under network policy.
pub fn frozen_spendable(whitelisted: bool, blacklisted: bool, value: Amount, max_tainted_value_out: Amount) -> bool {
    whitelisted || (!blacklisted && value <= max_tainted_value_out)
}

/// Lists the wallet outputs of `output_type` that pass every filter in
/// `coin_control`: ownership, spend state, explicit lock set, inclusive depth
/// range, safety, frozen/tainted policy and address reuse.
pub fn available_coins(
    wallet: &Wallet,
    chain: &dyn ChainView,
    settings: &WalletSettings,
    frozen: &Frozen,
    output_type: OutputType,
    coin_control: &CoinControl,
) -> Vec<Candidate> {
    let used = if coin_control.avoid_address_reuse { wallet.used_scripts() } else { HashSet::new() };
    let mut out = Vec::new();
    for (txid, record) in wallet.records() {
        let depth = wallet.depth(record, chain);
        if depth < 0 || !coin_control.depth_in_range(depth) {
            continue;
        }
        let trusted = depth > 0 || record.is_from_me();
        if !trusted && !coin_control.include_unsafe_inputs {
            continue;
        }
        let tx_frozen = output_type == OutputType::Blind && chain.is_frozen_blind_output(txid);
        let stored = if output_type == OutputType::Anon {
            match wallet.stored_transaction(txid) {
                Ok(s) => s,
                Err(e) => {
                    warn!(txid = %hex::encode(txid), error = %e, "unreadable stored transaction");
                    None
                }
            }
        } else {
            None
        };

        for o in &record.outputs {
            if o.output_type != output_type || o.is_placeholder() || o.is_spent() || o.value == UNKNOWN_VALUE {
                continue;
            }
            if o.is_stake_only() {
                continue;
            }
            if !(o.is_owned() || (o.is_watch_only() && coin_control.allow_watch_only)) {
                continue;
            }
            if o.value < settings.min_owned_value {
                continue;
            }
            let outpoint = OutPoint::new(*txid, o.n as u32);
            if wallet.spent_by(&outpoint).is_some() {
                continue;
            }
            if wallet.is_locked_coin(&outpoint) && !coin_control.allow_locked {
                continue;
            }
            if !coin_control.allow_other_inputs && !coin_control.is_selected(&outpoint) {
                continue;
            }
            if !used.is_empty() && used.contains(&o.script) {
                continue;
            }

            let mut anon_index = None;
            if output_type == OutputType::Anon {
                let index = stored
                    .as_ref()
                    .and_then(|s| s.get_anon_pubkey(o.n as u32))
                    .and_then(|pk| chain.read_rct_output_link(&pk));
                let Some(index) = index else {
                    debug!(outpoint = %outpoint, "anonymous output has no chain index yet");
                    continue;
                };
                let key_image = stored.as_ref().and_then(|s| s.get_key_image(o.n as u32));
                if let Some(spender) = key_image.and_then(|ki| chain.read_rct_key_image(ki)) {
                    debug!(outpoint = %outpoint, spender = %hex::encode(spender), "key image already spent on chain");
                    continue;
                }
                if chain.is_frozen_anon_output(index) {
                    let whitelisted = chain.is_whitelisted_anon_output(index);
                    let blacklisted = chain.is_blacklisted_anon_output(index);
                    if !frozen_output_allowed(coin_control, frozen, whitelisted, blacklisted, o.value) {
                        continue;
                    }
                } else if chain.is_blacklisted_anon_output(index) {
                    continue;
                }
                anon_index = Some(index);
            } else if tx_frozen {
                let whitelisted = chain.is_whitelisted_blind_output(&outpoint);
                if !frozen_output_allowed(coin_control, frozen, whitelisted, false, o.value) {
                    continue;
                }
            }

            out.push(Candidate {
                outpoint,
                output_type,
                value: o.value,
                depth,
                script: o.script.clone(),
                flags: o.flags,
                anon_index,
            });
        }
    }
    out
}

fn frozen_output_allowed(cc: &CoinControl, frozen: &Frozen, whitelisted: bool, blacklisted: bool, value: Amount) -> bool {
    if !cc.spend_frozen_blinded {
        return false;
    }
    if whitelisted {
        return true;
    }
    cc.include_tainted_frozen && frozen_spendable(false, blacklisted, value, frozen.max_tainted_value_out)
}

/// Orders candidates largest first, breaking ties randomly. With
/// `avoid_partial_spends`, outputs sharing a script are kept together and
/// groups are ordered by their total.
fn order_candidates<R: RngCore + ?Sized>(mut candidates: Vec<Candidate>, group: bool, rng: &mut R) -> Vec<Vec<Candidate>> {
    candidates.shuffle(rng);
    if !group {
        candidates.sort_by(|a, b| b.value.cmp(&a.value));
        return candidates.into_iter().map(|c| vec![c]).collect();
    }
    let mut groups: BTreeMap<Vec<u8>, Vec<Candidate>> = BTreeMap::new();
    for c in candidates {
        groups.entry(c.script.clone()).or_default().push(c);
    }
    let mut groups: Vec<Vec<Candidate>> = groups.into_values().collect();
    groups.shuffle(rng);
    groups.sort_by(|a, b| {
        let ta: Amount = a.iter().map(|c| c.value).sum();
        let tb: Amount = b.iter().map(|c| c.value).sum();
        tb.cmp(&ta)
    });
    groups
}

fn resolve_coin(wallet: &Wallet, c: &Candidate) -> Result<Option<SelectedCoin>> {
    if c.output_type == OutputType::Standard {
        return Ok(Some(SelectedCoin {
            outpoint: c.outpoint,
            output_type: c.output_type,
            value: c.value,
            blind: BlindingFactor::zero(),
            commitment: None,
            pubkey: None,
            anon_index: None,
            external: false,
            key_image: None,
        }));
    }
    let Some(stored) = wallet.stored_transaction(&c.outpoint.txid)? else {
        warn!(outpoint = %c.outpoint, "no stored transaction for shielded output");
        return Ok(None);
    };
    let Some(blind) = stored.get_blind(c.outpoint.n) else {
        warn!(outpoint = %c.outpoint, "no blinding factor for shielded output");
        return Ok(None);
    };
    let out = stored.tx.outputs.get(c.outpoint.n as usize);
    Ok(Some(SelectedCoin {
        outpoint: c.outpoint,
        output_type: c.output_type,
        value: c.value,
        blind: blind.clone(),
        commitment: out.and_then(|o| o.commitment().copied()),
        pubkey: stored.get_anon_pubkey(c.outpoint.n),
        anon_index: c.anon_index,
        external: false,
        key_image: stored.get_key_image(c.outpoint.n).map(|k| k.to_vec()),
    }))
}

/// Chooses inputs of `output_type` whose values reach `target`.
///
/// Outpoints with `CoinControl::input_data` entries are verified and used
/// first, then explicitly selected wallet outputs, then the rest largest
/// first. Outputs that need the wallet unlocked are passed over while it is
/// locked; if that is the only reason the target is missed the error is
/// `LockedOutputRequiresUnlock`.
#[allow(clippy::too_many_arguments)]
pub fn select_inputs<R: RngCore + ?Sized>(
    wallet: &Wallet,
    chain: &dyn ChainView,
    settings: &WalletSettings,
    frozen: &Frozen,
    output_type: OutputType,
    target: Amount,
    coin_control: &CoinControl,
    rng: &mut R,
) -> Result<Selection> {
    coin_control.validate()?;
    let result = select_inputs_inner(wallet, chain, settings, frozen, output_type, target, coin_control, rng);
    if result.is_err() {
        crate::metrics::SELECTION_FAILURES.inc();
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn select_inputs_inner<R: RngCore + ?Sized>(
    wallet: &Wallet,
    chain: &dyn ChainView,
    settings: &WalletSettings,
    frozen: &Frozen,
    output_type: OutputType,
    target: Amount,
    coin_control: &CoinControl,
    rng: &mut R,
) -> Result<Selection> {
    let mut coins = Vec::new();
    let mut total: Amount = 0;
    let mut taken: BTreeSet<OutPoint> = BTreeSet::new();

    for (outpoint, data) in &coin_control.input_data {
        if data.output_type != output_type {
            continue;
        }
        if coin_control.has_selected() && !coin_control.is_selected(outpoint) {
            continue;
        }
        data.verify(outpoint)?;
        coins.push(SelectedCoin {
            outpoint: *outpoint,
            output_type,
            value: data.value,
            blind: data.blind.clone(),
            commitment: data.commitment,
            pubkey: data.pubkey,
            anon_index: data.pubkey.and_then(|pk| chain.read_rct_output_link(&pk)),
            external: true,
            key_image: None,
        });
        total += data.value;
        taken.insert(*outpoint);
    }

    let candidates = available_coins(wallet, chain, settings, frozen, output_type, coin_control);
    let (preselected, rest): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .filter(|c| !taken.contains(&c.outpoint))
        .partition(|c| coin_control.is_selected(&c.outpoint));

    let mut skipped_locked: Option<OutPoint> = None;

    for c in &preselected {
        if c.flags & ORF_LOCKED != 0 && wallet.is_locked() {
            return Err(WalletError::LockedOutputRequiresUnlock(c.outpoint));
        }
        if let Some(coin) = resolve_coin(wallet, c)? {
            total += coin.value;
            coins.push(coin);
        }
    }
    for op in &coin_control.selected {
        let known = taken.contains(op) || preselected.iter().any(|c| c.outpoint == *op);
        if !known && !coin_control.input_data.contains_key(op) {
            return Err(WalletError::Validation(format!("selected input {} is not spendable", op)));
        }
    }

    if total < target {
        for group in order_candidates(rest, coin_control.avoid_partial_spends, rng) {
            if total >= target {
                break;
            }
            let mut resolved = Vec::new();
            let mut usable = true;
            for c in &group {
                if c.flags & ORF_LOCKED != 0 && wallet.is_locked() {
                    skipped_locked.get_or_insert(c.outpoint);
                    usable = false;
                    break;
                }
                match resolve_coin(wallet, c)? {
                    Some(coin) => resolved.push(coin),
                    None => {
                        usable = false;
                        break;
                    }
                }
            }
            if !usable {
                continue;
            }
            for coin in resolved {
                total += coin.value;
                coins.push(coin);
            }
        }
    }

    if total < target {
        if let Some(op) = skipped_locked {
            return Err(WalletError::LockedOutputRequiresUnlock(op));
        }
        debug!(wallet = wallet.name(), %output_type, target, available = total, "insufficient funds");
        return Err(WalletError::InsufficientFunds { requested: target, available: total });
    }
    debug!(wallet = wallet.name(), %output_type, target, total, inputs = coins.len(), "inputs selected");
    Ok(Selection { coins, total })
}

/// Ring index matrix for one ring signature.
///
/// `rows[i][secret_column]` is the real index of input `i`; every other
/// column holds a decoy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingMatrix {
    pub ring_size: usize,
    pub secret_column: usize,
    pub rows: Vec<Vec<i64>>,
}

impl RingMatrix {
    pub fn decoys(&self, row: usize) -> impl Iterator<Item = i64> + '_ {
        let secret = self.secret_column;
        self.rows[row]
            .iter()
            .enumerate()
            .filter(move |(c, _)| *c != secret)
            .map(|(_, i)| *i)
    }
}

fn index_window(mode: MixinSelectionMode, settings: &WalletSettings, count: i64, real: i64) -> (i64, i64) {
    match mode {
        MixinSelectionMode::Recent => ((count - settings.rct_recent_window + 1).max(1), count),
        MixinSelectionMode::Nearby => (
            (real - settings.rct_nearby_window).max(1),
            (real + settings.rct_nearby_window).min(count),
        ),
        MixinSelectionMode::FullRange | MixinSelectionMode::Debug => (1, count),
    }
}

fn draw_decoys<R: RngCore + ?Sized>(
    chain: &dyn ChainView,
    lo: i64,
    hi: i64,
    reals: &[i64],
    needed: usize,
    rng: &mut R,
) -> Result<Vec<i64>> {
    let span = if hi >= lo { hi - lo + 1 } else { 0 };
    let reals_in_range = reals.iter().filter(|r| (lo..=hi).contains(*r)).count() as i64;
    let upper_bound = (span - reals_in_range).max(0) as usize;
    if upper_bound < needed {
        return Err(WalletError::InsufficientMixins { needed, available: upper_bound });
    }
    if span <= EXACT_POOL_LIMIT {
        let pool: Vec<i64> = (lo..=hi)
            .filter(|i| !reals.contains(i) && !chain.is_blacklisted_anon_output(*i))
            .collect();
        if pool.len() < needed {
            return Err(WalletError::InsufficientMixins { needed, available: pool.len() });
        }
        return Ok(pool.choose_multiple(rng, needed).copied().collect());
    }
    let mut picked: BTreeSet<i64> = BTreeSet::new();
    let mut attempts = 0usize;
    while picked.len() < needed {
        if attempts >= needed * SAMPLE_ATTEMPTS_PER_DECOY {
            return Err(WalletError::InsufficientMixins { needed, available: picked.len() });
        }
        attempts += 1;
        let i = rng.gen_range(lo..=hi);
        if reals.contains(&i) || chain.is_blacklisted_anon_output(i) {
            continue;
        }
        picked.insert(i);
    }
    let mut out: Vec<i64> = picked.into_iter().collect();
    out.shuffle(rng);
    Ok(out)
}

/// Picks `ring_size - 1` decoys for each real input and places the real
/// indices in a random secret column.
///
/// Decoys never equal a real index of the ring, are distinct within a row and
/// are never blacklisted.
pub fn pick_hiding_outputs<R: RngCore + ?Sized>(
    chain: &dyn ChainView,
    settings: &WalletSettings,
    real_indices: &[i64],
    ring_size: usize,
    mode: MixinSelectionMode,
    use_mixins: &[i64],
    rng: &mut R,
) -> Result<RingMatrix> {
    if real_indices.is_empty() {
        return Err(WalletError::Validation("ring has no real inputs".into()));
    }
    if ring_size < settings.min_ring_size || ring_size > settings.max_ring_size {
        return Err(WalletError::Validation(format!(
            "ring size {} outside {}..={}",
            ring_size, settings.min_ring_size, settings.max_ring_size
        )));
    }
    if real_indices.len() > settings.max_anon_inputs {
        return Err(WalletError::Validation(format!(
            "{} anonymous inputs exceed the limit of {}",
            real_indices.len(),
            settings.max_anon_inputs
        )));
    }
    let count = chain.anon_output_count();
    let needed = ring_size - 1;
    let secret_column = rng.gen_range(0..ring_size);
    let result = build_rows(chain, settings, real_indices, count, needed, secret_column, mode, use_mixins, rng);
    if let Err(WalletError::InsufficientMixins { .. }) = &result {
        crate::metrics::MIXIN_SHORTAGES.inc();
    }
    let rows = result?;
    debug!(ring_size, inputs = real_indices.len(), ?mode, "ring built");
    Ok(RingMatrix { ring_size, secret_column, rows })
}

#[allow(clippy::too_many_arguments)]
fn build_rows<R: RngCore + ?Sized>(
    chain: &dyn ChainView,
    settings: &WalletSettings,
    reals: &[i64],
    count: i64,
    needed: usize,
    secret_column: usize,
    mode: MixinSelectionMode,
    use_mixins: &[i64],
    rng: &mut R,
) -> Result<Vec<Vec<i64>>> {
    let mut rows = Vec::with_capacity(reals.len());
    let mut debug_mixins = use_mixins.iter().copied();
    for &real in reals {
        if real < 1 || real > count {
            return Err(WalletError::Validation(format!("real index {} outside 1..={}", real, count)));
        }
        let decoys = if mode == MixinSelectionMode::Debug {
            let mut row: Vec<i64> = Vec::with_capacity(needed);
            while row.len() < needed {
                let Some(i) = debug_mixins.next() else {
                    return Err(WalletError::InsufficientMixins { needed, available: row.len() });
                };
                if i < 1 || i > count || reals.contains(&i) || row.contains(&i) || chain.is_blacklisted_anon_output(i) {
                    return Err(WalletError::Validation(format!("unusable mixin index {}", i)));
                }
                row.push(i);
            }
            row
        } else {
            let (lo, hi) = index_window(mode, settings, count, real);
            draw_decoys(chain, lo, hi, reals, needed, rng)?
        };
        let mut row = Vec::with_capacity(needed + 1);
        let mut decoys = decoys.into_iter();
        for column in 0..=needed {
            if column == secret_column {
                row.push(real);
            } else if let Some(d) = decoys.next() {
                row.push(d);
            }
        }
        rows.push(row);
    }
    Ok(rows)
}
