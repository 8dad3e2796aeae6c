use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use zeroize::Zeroizing;

use crate::crypto::{verify_commitment, BlindingFactor, Commitment, CompressedPubKey};
use crate::error::{Result, WalletError};
use crate::recipient::Destination;
use crate::records::{Amount, OutputType};
use crate::transaction::OutPoint;

pub const DEFAULT_MIN_DEPTH: i32 = 0;
pub const DEFAULT_MAX_DEPTH: i32 = 9_999_999;

/// How decoy indices are drawn for ring signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixinSelectionMode {
    /// Uniform over a bounded window of the most recent indices.
    Recent = 1,
    /// Clustered around the real input's index. Weaker privacy than the
    /// uniform modes: an observer who knows the clustering can narrow the
    /// real column down by chain position.
    Nearby = 2,
    /// Uniform over the full index range.
    FullRange = 3,
    /// Uses `CoinControl::use_mixins` verbatim.
    Debug = 99,
}

impl TryFrom<u8> for MixinSelectionMode {
    type Error = WalletError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(MixinSelectionMode::Recent),
            2 => Ok(MixinSelectionMode::Nearby),
            3 => Ok(MixinSelectionMode::FullRange),
            99 => Ok(MixinSelectionMode::Debug),
            other => Err(WalletError::Validation(format!("unknown mixin selection mode {}", other))),
        }
    }
}

/// Secret data for an input the wallet cannot resolve from its own ledger.
#[derive(Clone)]
pub struct InputData {
    pub value: Amount,
    pub blind: BlindingFactor,
    pub witness: Vec<Vec<u8>>,
    pub commitment: Option<Commitment>,
    pub pubkey: Option<CompressedPubKey>,
    pub privkey: Option<Zeroizing<Vec<u8>>>,
    pub output_type: OutputType,
}

impl std::fmt::Debug for InputData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputData")
            .field("value", &self.value)
            .field("commitment", &self.commitment)
            .field("output_type", &self.output_type)
            .field("has_privkey", &self.privkey.is_some())
            .finish()
    }
}

impl InputData {
    pub fn plain(value: Amount) -> Self {
        InputData {
            value,
            blind: BlindingFactor::zero(),
            witness: Vec::new(),
            commitment: None,
            pubkey: None,
            privkey: None,
            output_type: OutputType::Standard,
        }
    }

    pub fn shielded(output_type: OutputType, value: Amount, blind: BlindingFactor, commitment: Commitment) -> Self {
        InputData {
            value,
            blind,
            witness: Vec::new(),
            commitment: Some(commitment),
            pubkey: None,
            privkey: None,
            output_type,
        }
    }

    /// Checks the supplied commitment reopens to (value, blind).
    pub fn verify(&self, outpoint: &OutPoint) -> Result<()> {
        if self.value < 0 {
            return Err(WalletError::Validation(format!("input {} has a negative value", outpoint)));
        }
        match self.output_type {
            OutputType::Standard => Ok(()),
            OutputType::Blind | OutputType::Anon => {
                let commitment = self.commitment.as_ref().ok_or_else(|| {
                    WalletError::Validation(format!("input {} is missing its commitment", outpoint))
                })?;
                if verify_commitment(commitment, &self.blind, self.value as u64) {
                    Ok(())
                } else {
                    Err(WalletError::CommitmentMismatch(format!("input {}", outpoint)))
                }
            }
        }
    }
}

/// Selection and override state for one funding attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct CoinControl {
    pub selected: BTreeSet<OutPoint>,
    /// If false, only selected inputs are used.
    pub allow_other_inputs: bool,
    pub allow_watch_only: bool,
    pub include_unsafe_inputs: bool,
    pub min_depth: i32,
    pub max_depth: i32,
    /// Base units per 1000 bytes.
    pub fee_rate: Option<Amount>,
    pub override_fee_rate: bool,
    pub extra_fee: Amount,
    pub avoid_partial_spends: bool,
    pub avoid_address_reuse: bool,
    pub coin_type: OutputType,
    pub input_data: BTreeMap<OutPoint, InputData>,
    pub allow_locked: bool,
    pub add_change_output: bool,
    pub change_destination: Option<Destination>,
    pub change_type: Option<OutputType>,
    pub spend_frozen_blinded: bool,
    pub include_tainted_frozen: bool,
    pub use_mixins: Vec<i64>,
    /// Overrides the wallet's configured mode when set.
    pub mixin_selection_mode: Option<MixinSelectionMode>,
}

impl Default for CoinControl {
    fn default() -> Self {
        CoinControl {
            selected: BTreeSet::new(),
            allow_other_inputs: true,
            allow_watch_only: false,
            include_unsafe_inputs: false,
            min_depth: DEFAULT_MIN_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
            fee_rate: None,
            override_fee_rate: false,
            extra_fee: 0,
            avoid_partial_spends: false,
            avoid_address_reuse: false,
            coin_type: OutputType::Standard,
            input_data: BTreeMap::new(),
            allow_locked: false,
            add_change_output: true,
            change_destination: None,
            change_type: None,
            spend_frozen_blinded: false,
            include_tainted_frozen: false,
            use_mixins: Vec::new(),
            mixin_selection_mode: None,
        }
    }
}

impl CoinControl {
    pub fn new(coin_type: OutputType) -> Self {
        CoinControl { coin_type, ..Default::default() }
    }

    pub fn has_selected(&self) -> bool {
        !self.selected.is_empty()
    }

    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.selected.contains(outpoint)
    }

    pub fn select(&mut self, outpoint: OutPoint) {
        self.selected.insert(outpoint);
    }

    pub fn unselect(&mut self, outpoint: &OutPoint) {
        self.selected.remove(outpoint);
    }

    pub fn unselect_all(&mut self) {
        self.selected.clear();
    }

    pub fn list_selected(&self) -> Vec<OutPoint> {
        self.selected.iter().copied().collect()
    }

    pub fn set_input_data(&mut self, outpoint: OutPoint, data: InputData) {
        self.input_data.insert(outpoint, data);
    }

    pub fn depth_in_range(&self, depth: i32) -> bool {
        self.min_depth <= depth && depth <= self.max_depth
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_depth < 0 || self.max_depth < self.min_depth {
            return Err(WalletError::Validation(format!(
                "invalid depth range {}..={}",
                self.min_depth, self.max_depth
            )));
        }
        if self.override_fee_rate && self.fee_rate.is_none() {
            return Err(WalletError::Validation("fee rate override set without a fee rate".into()));
        }
        if let Some(rate) = self.fee_rate {
            if rate < 0 {
                return Err(WalletError::Validation("negative fee rate".into()));
            }
        }
        Ok(())
    }
}
