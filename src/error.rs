use std::time::Duration;
use thiserror::Error;

use crate::records::Amount;
use crate::transaction::OutPoint;

pub type Result<T> = std::result::Result<T, WalletError>;

/// Broad buckets callers use to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input, surfaced immediately and never retried.
    Validation,
    /// Not enough funds or decoys; the caller may retry with relaxed constraints.
    Funding,
    /// Database open/read/write/commit failure.
    Persistence,
    /// Commitment or blind-sum mismatch. Never swallowed, never broadcast.
    CryptoInvariant,
}

/// Errors that can occur while maintaining the ledger or building a transaction
#[derive(Error, Debug)]
pub enum WalletError {
    /// Malformed caller input (bad hex, wrong length, unknown type)
    #[error("Validation error: {0}")]
    Validation(String),

    /// An output with this index already exists in the record
    #[error("Duplicate output index {0}")]
    DuplicateIndex(u16),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Amount, available: Amount },

    #[error("Insufficient mixins: need {needed} decoys, {available} eligible")]
    InsufficientMixins { needed: usize, available: usize },

    #[error("Output {0} requires the wallet to be unlocked")]
    LockedOutputRequiresUnlock(OutPoint),

    #[error("Wallet {0} is locked")]
    WalletLocked(String),

    #[error("Range proof error: {0}")]
    RangeProof(String),

    /// A commitment does not reopen to its claimed (value, blind) pair
    #[error("Commitment mismatch at {0}")]
    CommitmentMismatch(String),

    #[error("Blind sum imbalance: {0}")]
    BlindSumImbalance(String),

    #[error("Crypto invariant violation: {0}")]
    CryptoInvariant(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Build did not finish within {0:?}")]
    Timeout(Duration),
}

impl WalletError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WalletError::Validation(_)
            | WalletError::DuplicateIndex(_)
            | WalletError::NotFound(_)
            | WalletError::LockedOutputRequiresUnlock(_)
            | WalletError::WalletLocked(_)
            | WalletError::RangeProof(_)
            | WalletError::Config(_)
            | WalletError::Timeout(_) => ErrorCategory::Validation,
            WalletError::InsufficientFunds { .. } | WalletError::InsufficientMixins { .. } => {
                ErrorCategory::Funding
            }
            WalletError::Persistence(_) | WalletError::Encoding(_) => ErrorCategory::Persistence,
            WalletError::CommitmentMismatch(_)
            | WalletError::BlindSumImbalance(_)
            | WalletError::CryptoInvariant(_) => ErrorCategory::CryptoInvariant,
        }
    }

    /// Only funding shortfalls may be retried, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Funding
    }

    pub fn is_crypto_invariant(&self) -> bool {
        self.category() == ErrorCategory::CryptoInvariant
    }
}

impl From<rocksdb::Error> for WalletError {
    fn from(error: rocksdb::Error) -> Self {
        WalletError::Persistence(error.to_string())
    }
}

impl From<hex::FromHexError> for WalletError {
    fn from(error: hex::FromHexError) -> Self {
        WalletError::Validation(format!("invalid hex: {}", error))
    }
}
