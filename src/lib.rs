// Library interface for the confidential-output wallet
// Tests and the ctwallet binary use the ledger and builder through here

pub mod blind;
pub mod builder;
pub mod chain;
pub mod coin_control;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod rangeproof;
pub mod recipient;
pub mod records;
pub mod selection;
pub mod storage;
pub mod tracer;
pub mod transaction;
pub mod wallet;

pub use builder::{build_with_deadline, BuiltTransaction, TransactionBuilder};
pub use chain::{ChainView, MemoryChain};
pub use coin_control::{CoinControl, InputData, MixinSelectionMode};
pub use crypto::{blake3_hash, commit, verify_commitment, BlindingFactor, Commitment};
pub use error::{Result, WalletError};
pub use records::{Amount, OutputRecord, OutputType, StoredTransaction, TransactionRecord, Txid, COIN};
pub use storage::{KvStore, MemoryStore, Store};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
pub use wallet::{Wallet, WalletHandle};
