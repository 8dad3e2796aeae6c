//! Wallet-side records for outputs that cannot be matched by script alone.
//!
//! A `TransactionRecord` summarizes one transaction (block position, fee,
//! resolved inputs, and the list of `OutputRecord`s). A `StoredTransaction`
//! keeps the full transaction plus the blinding factors needed to reopen its
//! shielded outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::crypto::{BlindingFactor, CompressedPubKey};
use crate::error::{Result, WalletError};
use crate::transaction::{OutPoint, Transaction, TxOut};

pub type Txid = [u8; 32];
pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

/// Output index reserved for reconstructed amounts of undecodable outputs.
pub const OR_PLACEHOLDER_N: u16 = 0xFFFF;

/// Value of an output whose amount could not be recovered.
pub const UNKNOWN_VALUE: Amount = -1;

/// Block hash marking an abandoned transaction (uint256 value one).
pub const ABANDON_HASH: [u8; 32] = {
    let mut h = [0u8; 32];
    h[0] = 1;
    h
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OutputType {
    Standard = 1,
    Blind = 2,
    Anon = 3,
}

impl From<OutputType> for u8 {
    fn from(t: OutputType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for OutputType {
    type Error = WalletError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(OutputType::Standard),
            2 => Ok(OutputType::Blind),
            3 => Ok(OutputType::Anon),
            other => Err(WalletError::Validation(format!("unknown output type {}", other))),
        }
    }
}

impl std::str::FromStr for OutputType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "plain" | "part" => Ok(OutputType::Standard),
            "blind" | "blinded" => Ok(OutputType::Blind),
            "anon" | "anonymous" => Ok(OutputType::Anon),
            other => Err(WalletError::Validation(format!("unknown output type '{}'", other))),
        }
    }
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputType::Standard => "standard",
            OutputType::Blind => "blind",
            OutputType::Anon => "anon",
        })
    }
}

// OutputRecord flags
pub const ORF_OWNED: u8 = 1 << 0;
pub const ORF_FROM: u8 = 1 << 1;
pub const ORF_CHANGE: u8 = 1 << 2;
pub const ORF_SPENT: u8 = 1 << 3;
pub const ORF_LOCKED: u8 = 1 << 4;
pub const ORF_STAKEONLY: u8 = 1 << 5;
pub const ORF_WATCHONLY: u8 = 1 << 6;
pub const ORF_HARDWARE_DEVICE: u8 = 1 << 7;

// TransactionRecord flags
pub const RTXF_BLIND_IN: u16 = 1 << 14;
pub const RTXF_ANON_IN: u16 = 1 << 15;

/// Scheme that produced the destination, tagged by the first byte of `path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOrigin {
    ExtKey = 1,
    Stealth = 2,
    Standard = 3,
}

impl AddressOrigin {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(AddressOrigin::ExtKey),
            2 => Some(AddressOrigin::Stealth),
            3 => Some(AddressOrigin::Standard),
            _ => None,
        }
    }
}

/// Tags of the extensible value map on a `TransactionRecord`.
pub mod value_tag {
    pub const EPHEM_PATH: u8 = 1;
    pub const REPLACES: u8 = 2;
    pub const REPLACED_BY: u8 = 3;
    pub const COMMENT: u8 = 4;
    pub const TO: u8 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub output_type: OutputType,
    pub flags: u8,
    pub n: u16,
    pub value: Amount,
    pub script: Vec<u8>,
    pub narration: String,
    pub path: Vec<u8>,
}

impl OutputRecord {
    pub fn new(output_type: OutputType, n: u16, value: Amount) -> Self {
        OutputRecord {
            output_type,
            flags: 0,
            n,
            value,
            script: Vec::new(),
            narration: String::new(),
            path: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_owned(&self) -> bool { self.flags & ORF_OWNED != 0 }
    pub fn is_from_me(&self) -> bool { self.flags & ORF_FROM != 0 }
    pub fn is_change(&self) -> bool { self.flags & ORF_CHANGE != 0 }
    pub fn is_spent(&self) -> bool { self.flags & ORF_SPENT != 0 }
    pub fn is_locked(&self) -> bool { self.flags & ORF_LOCKED != 0 }
    pub fn is_stake_only(&self) -> bool { self.flags & ORF_STAKEONLY != 0 }
    pub fn is_watch_only(&self) -> bool { self.flags & ORF_WATCHONLY != 0 }
    pub fn is_hardware(&self) -> bool { self.flags & ORF_HARDWARE_DEVICE != 0 }

    pub fn set_spent(&mut self, spent: bool) {
        if spent {
            self.flags |= ORF_SPENT;
        } else {
            self.flags &= !ORF_SPENT;
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.n == OR_PLACEHOLDER_N
    }

    pub fn is_shielded(&self) -> bool {
        self.output_type != OutputType::Standard
    }

    pub fn address_origin(&self) -> Option<AddressOrigin> {
        self.path.first().copied().and_then(AddressOrigin::from_tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub block_hash: [u8; 32],
    /// Not persisted; re-derived from the chain view on load.
    #[serde(skip)]
    pub block_height: i32,
    pub flags: u16,
    pub index: i16,
    pub block_time: i64,
    pub time_received: i64,
    pub value_map: BTreeMap<u8, Vec<u8>>,
    pub fee: Amount,
    pub inputs: Vec<OutPoint>,
    /// Sorted by `n`.
    pub outputs: Vec<OutputRecord>,
}

impl Default for TransactionRecord {
    fn default() -> Self {
        TransactionRecord {
            block_hash: [0u8; 32],
            block_height: 0,
            flags: 0,
            index: 0,
            block_time: 0,
            time_received: 0,
            value_map: BTreeMap::new(),
            fee: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

impl TransactionRecord {
    pub fn new(time_received: i64) -> Self {
        TransactionRecord { time_received, ..Default::default() }
    }

    /// Appends or replaces by index.
    ///
    /// A duplicate `n` is rejected unless `replace` is set. At most one
    /// output may carry the change flag.
    pub fn insert_output(&mut self, record: OutputRecord, replace: bool) -> Result<()> {
        if record.is_change() {
            if let Some(existing) = self.outputs.iter().find(|o| o.is_change()) {
                if existing.n != record.n {
                    return Err(WalletError::Validation(format!(
                        "record already has change output {}, cannot add {}",
                        existing.n, record.n
                    )));
                }
            }
        }
        match self.outputs.binary_search_by_key(&record.n, |o| o.n) {
            Ok(pos) => {
                if !replace {
                    return Err(WalletError::DuplicateIndex(record.n));
                }
                self.outputs[pos] = record;
            }
            Err(pos) => self.outputs.insert(pos, record),
        }
        Ok(())
    }

    /// No-op if absent.
    pub fn erase_output(&mut self, n: u16) {
        if let Ok(pos) = self.outputs.binary_search_by_key(&n, |o| o.n) {
            self.outputs.remove(pos);
        }
    }

    pub fn get_output(&self, n: u16) -> Result<&OutputRecord> {
        self.outputs
            .binary_search_by_key(&n, |o| o.n)
            .map(|pos| &self.outputs[pos])
            .map_err(|_| WalletError::NotFound(format!("output {}", n)))
    }

    pub fn get_output_mut(&mut self, n: u16) -> Result<&mut OutputRecord> {
        match self.outputs.binary_search_by_key(&n, |o| o.n) {
            Ok(pos) => Ok(&mut self.outputs[pos]),
            Err(_) => Err(WalletError::NotFound(format!("output {}", n))),
        }
    }

    pub fn get_change_output(&self) -> Result<&OutputRecord> {
        self.outputs
            .iter()
            .find(|o| o.is_change())
            .ok_or_else(|| WalletError::NotFound("change output".into()))
    }

    pub fn has_change(&self) -> bool {
        self.outputs.iter().any(|o| o.is_change())
    }

    /// Sum of every output value. Refuses to add the `-1` placeholder value.
    pub fn total_output(&self) -> Result<Amount> {
        let mut total: Amount = 0;
        for o in &self.outputs {
            if o.value == UNKNOWN_VALUE {
                return Err(WalletError::Validation(format!(
                    "output {} has an unresolved value",
                    o.n
                )));
            }
            total = total
                .checked_add(o.value)
                .ok_or_else(|| WalletError::Validation("output total overflows".into()))?;
        }
        Ok(total)
    }

    /// Display total that skips unresolved values.
    pub fn total_resolved_output(&self) -> Amount {
        self.outputs
            .iter()
            .filter(|o| o.value != UNKNOWN_VALUE)
            .map(|o| o.value)
            .sum()
    }

    pub fn is_abandoned(&self) -> bool {
        self.block_hash == ABANDON_HASH
    }

    pub fn hash_unset(&self) -> bool {
        self.block_hash == [0u8; 32] || self.is_abandoned()
    }

    pub fn is_conflicted(&self) -> bool {
        self.index == -1
    }

    pub fn set_abandoned(&mut self) {
        self.block_hash = ABANDON_HASH;
    }

    pub fn set_conflicted(&mut self) {
        self.index = -1;
    }

    pub fn set_merkle_branch(&mut self, block_hash: [u8; 32], index: i16, block_height: i32, block_time: i64) {
        self.block_hash = block_hash;
        self.index = index;
        self.block_height = block_height;
        self.block_time = block_time;
    }

    /// Effective wallet time.
    pub fn tx_time(&self) -> i64 {
        if !self.hash_unset() && self.block_time > 0 {
            self.time_received.min(self.block_time)
        } else {
            self.time_received
        }
    }

    pub fn input_type(&self) -> OutputType {
        if self.flags & RTXF_ANON_IN != 0 {
            OutputType::Anon
        } else if self.flags & RTXF_BLIND_IN != 0 {
            OutputType::Blind
        } else {
            OutputType::Standard
        }
    }

    pub fn set_input_type(&mut self, input_type: OutputType) {
        self.flags &= !(RTXF_ANON_IN | RTXF_BLIND_IN);
        match input_type {
            OutputType::Anon => self.flags |= RTXF_ANON_IN,
            OutputType::Blind => self.flags |= RTXF_BLIND_IN,
            OutputType::Standard => {}
        }
    }

    pub fn is_from_me(&self) -> bool {
        self.outputs.iter().any(|o| o.is_from_me())
    }

    pub fn set_value(&mut self, tag: u8, value: Vec<u8>) {
        self.value_map.insert(tag, value);
    }

    pub fn value(&self, tag: u8) -> Option<&[u8]> {
        self.value_map.get(&tag).map(|v| v.as_slice())
    }

    pub fn comment(&self) -> Option<String> {
        self.value(value_tag::COMMENT).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.set_value(value_tag::COMMENT, comment.as_bytes().to_vec());
    }

    pub fn to_label(&self) -> Option<String> {
        self.value(value_tag::TO).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn set_to_label(&mut self, to: &str) {
        self.set_value(value_tag::TO, to.as_bytes().to_vec());
    }

    pub fn replaced_by(&self) -> Option<Txid> {
        self.value(value_tag::REPLACED_BY).and_then(|v| v.try_into().ok())
    }

    pub fn set_replaced_by(&mut self, txid: &Txid) {
        self.set_value(value_tag::REPLACED_BY, txid.to_vec());
    }

    pub fn replaces(&self) -> Option<Txid> {
        self.value(value_tag::REPLACES).and_then(|v| v.try_into().ok())
    }

    pub fn set_replaces(&mut self, txid: &Txid) {
        self.set_value(value_tag::REPLACES, txid.to_vec());
    }

    pub fn ephemeral_path(&self) -> Option<&[u8]> {
        self.value(value_tag::EPHEM_PATH)
    }
}

/// Full transaction plus the secret material to reopen its shielded outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx: Transaction,
    /// (output index, blinding factor), sorted by index.
    pub blinds: Vec<(u32, BlindingFactor)>,
    /// (output index, key image) of owned anonymous outputs, sorted by index.
    pub key_images: Vec<(u32, Vec<u8>)>,
}

impl StoredTransaction {
    pub fn new(tx: Transaction) -> Self {
        StoredTransaction { tx, blinds: Vec::new(), key_images: Vec::new() }
    }

    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    /// Replace-by-index.
    pub fn insert_blind(&mut self, n: u32, blind: BlindingFactor) {
        match self.blinds.binary_search_by_key(&n, |(i, _)| *i) {
            Ok(pos) => self.blinds[pos].1 = blind,
            Err(pos) => self.blinds.insert(pos, (n, blind)),
        }
    }

    pub fn get_blind(&self, n: u32) -> Option<&BlindingFactor> {
        self.blinds
            .binary_search_by_key(&n, |(i, _)| *i)
            .ok()
            .map(|pos| &self.blinds[pos].1)
    }

    pub fn insert_key_image(&mut self, n: u32, key_image: Vec<u8>) {
        match self.key_images.binary_search_by_key(&n, |(i, _)| *i) {
            Ok(pos) => self.key_images[pos].1 = key_image,
            Err(pos) => self.key_images.insert(pos, (n, key_image)),
        }
    }

    pub fn get_key_image(&self, n: u32) -> Option<&[u8]> {
        self.key_images
            .binary_search_by_key(&n, |(i, _)| *i)
            .ok()
            .map(|pos| self.key_images[pos].1.as_slice())
    }

    pub fn get_anon_pubkey(&self, n: u32) -> Option<CompressedPubKey> {
        match self.tx.outputs.get(n as usize) {
            Some(TxOut::Anonymous { pubkey, .. }) => Some(*pubkey),
            _ => None,
        }
    }

    /// Drops the blinds for the given outputs. Returns how many were removed.
    pub fn prune_blinds(&mut self, outputs: &[u32]) -> usize {
        let before = self.blinds.len();
        self.blinds.retain(|(n, _)| !outputs.contains(n));
        before - self.blinds.len()
    }

    /// Shielded outputs that must have a stored blind but do not.
    pub fn missing_blinds(&self, record: &TransactionRecord) -> Vec<u16> {
        record
            .outputs
            .iter()
            .filter(|o| o.is_shielded() && !o.is_placeholder())
            .filter(|o| o.is_owned() || o.is_from_me())
            .filter(|o| !o.is_spent())
            .filter(|o| self.get_blind(o.n as u32).is_none())
            .map(|o| o.n)
            .collect()
    }

    pub fn outpoint(&self, n: u32) -> OutPoint {
        OutPoint::new(self.txid(), n)
    }
}

/// Parses a decimal coin amount such as `"1.498"` into base units.
pub fn parse_amount(s: &str) -> Result<Amount> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
        return Err(WalletError::Validation(format!("invalid amount '{}'", s)));
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(WalletError::Validation(format!("invalid amount '{}'", s)));
    }
    if frac.len() > 8 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(WalletError::Validation(format!("invalid amount '{}'", s)));
    }
    let whole: Amount = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| WalletError::Validation(format!("amount out of range '{}'", s)))?
    };
    let mut frac_units: Amount = 0;
    for (i, c) in frac.chars().enumerate() {
        frac_units += Amount::from(c as u8 - b'0') * 10i64.pow(7 - i as u32);
    }
    let total = whole
        .checked_mul(COIN)
        .and_then(|v| v.checked_add(frac_units))
        .filter(|v| *v <= MAX_MONEY)
        .ok_or_else(|| WalletError::Validation(format!("amount out of range '{}'", s)))?;
    Ok(total)
}

pub fn format_amount(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    format!("{}{}.{:08}", sign, abs / COIN as u64, abs % COIN as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_parse_and_format() {
        assert_eq!(parse_amount("1.498").unwrap(), 149_800_000);
        assert_eq!(parse_amount("0.002").unwrap(), 200_000);
        assert_eq!(parse_amount("3").unwrap(), 3 * COIN);
        assert!(parse_amount("1.000000001").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount(".").is_err());
        assert!(parse_amount(" . ").is_err());
        assert_eq!(parse_amount(".5").unwrap(), COIN / 2);
        assert_eq!(parse_amount("2.").unwrap(), 2 * COIN);
        assert_eq!(format_amount(149_800_000), "1.49800000");
        assert_eq!(format_amount(-1), "-0.00000001");
    }

    #[test]
    fn address_origin_is_read_from_path() {
        let mut r = OutputRecord::new(OutputType::Blind, 0, 5);
        assert_eq!(r.address_origin(), None);
        r.path = vec![2, 0, 0, 0, 1];
        assert_eq!(r.address_origin(), Some(AddressOrigin::Stealth));
    }
}
