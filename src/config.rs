use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

use crate::coin_control::MixinSelectionMode;
use crate::records::{Amount, COIN};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub wallet: WalletSettings,
    #[serde(default)]
    pub frozen: Frozen,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletSettings {
    #[serde(default = "default_ring_size")]
    pub default_ring_size: usize,
    #[serde(default = "default_min_ring_size")]
    pub min_ring_size: usize,
    #[serde(default = "default_max_ring_size")]
    pub max_ring_size: usize,
    #[serde(default = "default_inputs_per_sig")]
    pub inputs_per_sig: usize,
    #[serde(default = "default_max_anon_inputs")]
    pub max_anon_inputs: usize,
    #[serde(default = "default_mixin_mode")]
    pub mixin_selection_mode: u8,
    #[serde(default = "default_recent_window")]
    pub rct_recent_window: i64,
    #[serde(default = "default_nearby_window")]
    pub rct_nearby_window: i64,
    /// Base units per 1000 bytes.
    #[serde(default = "default_fee_rate")]
    pub fallback_fee_rate: Amount,
    #[serde(default)]
    pub min_owned_value: Amount,
    /// Prove shielded outputs with the legacy range proof instead of the compact one.
    #[serde(default)]
    pub legacy_range_proofs: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Frozen {
    #[serde(default = "default_max_tainted")]
    pub max_tainted_value_out: Amount,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_path() -> String { "wallet-db".into() }
fn default_ring_size() -> usize { 5 }
fn default_min_ring_size() -> usize { 3 }
fn default_max_ring_size() -> usize { 32 }
fn default_inputs_per_sig() -> usize { 1 }
fn default_max_anon_inputs() -> usize { 32 }
fn default_mixin_mode() -> u8 { 1 }
fn default_recent_window() -> i64 { 5_000 }
fn default_nearby_window() -> i64 { 1_000 }
fn default_fee_rate() -> Amount { 20_000 }
fn default_max_tainted() -> Amount { 500 * COIN }
fn default_level() -> String { "info".into() }

impl Default for Storage {
    fn default() -> Self {
        Storage { path: default_path() }
    }
}

impl Default for WalletSettings {
    fn default() -> Self {
        WalletSettings {
            default_ring_size: default_ring_size(),
            min_ring_size: default_min_ring_size(),
            max_ring_size: default_max_ring_size(),
            inputs_per_sig: default_inputs_per_sig(),
            max_anon_inputs: default_max_anon_inputs(),
            mixin_selection_mode: default_mixin_mode(),
            rct_recent_window: default_recent_window(),
            rct_nearby_window: default_nearby_window(),
            fallback_fee_rate: default_fee_rate(),
            min_owned_value: 0,
            legacy_range_proofs: false,
        }
    }
}

impl Default for Frozen {
    fn default() -> Self {
        Frozen { max_tainted_value_out: default_max_tainted() }
    }
}

impl Default for Log {
    fn default() -> Self {
        Log { level: default_level() }
    }
}

impl WalletSettings {
    pub fn mixin_mode(&self) -> crate::error::Result<MixinSelectionMode> {
        MixinSelectionMode::try_from(self.mixin_selection_mode)
    }

    fn check(&self) -> Result<()> {
        anyhow::ensure!(
            self.min_ring_size >= 1 && self.min_ring_size <= self.max_ring_size,
            "ring size bounds {}..={} are inconsistent",
            self.min_ring_size,
            self.max_ring_size
        );
        anyhow::ensure!(
            (self.min_ring_size..=self.max_ring_size).contains(&self.default_ring_size),
            "default ring size {} outside {}..={}",
            self.default_ring_size,
            self.min_ring_size,
            self.max_ring_size
        );
        anyhow::ensure!(self.inputs_per_sig >= 1, "inputs_per_sig must be at least 1");
        anyhow::ensure!(self.rct_recent_window > 0 && self.rct_nearby_window > 0, "mixin windows must be positive");
        anyhow::ensure!(self.fallback_fee_rate >= 0, "fallback fee rate must not be negative");
        self.mixin_mode()?;
        Ok(())
    }
}

/// Parse a TOML document into `Config`, applying defaults for missing keys.
pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).with_context(|| "📝  invalid TOML in config file".to_string())?;
    cfg.wallet.check().context("invalid [wallet] section")?;
    anyhow::ensure!(cfg.frozen.max_tainted_value_out >= 0, "max_tainted_value_out must not be negative");
    Ok(cfg)
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}
