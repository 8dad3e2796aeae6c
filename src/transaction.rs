use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::crypto::{blake3_hash, Commitment, CompressedPubKey};
use crate::error::{Result, WalletError};
use crate::records::{Amount, OutputType, Txid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub n: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, n: u32) -> Self {
        OutPoint { txid, n }
    }

    /// Key bytes: txid followed by the big-endian index, so outpoints of one
    /// transaction sort together.
    pub fn to_key(&self) -> [u8; 36] {
        let mut k = [0u8; 36];
        k[..32].copy_from_slice(&self.txid);
        k[32..].copy_from_slice(&self.n.to_be_bytes());
        k
    }

    pub fn from_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[..32]);
        let n = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        Some(OutPoint { txid, n })
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.n)
    }
}

impl std::str::FromStr for OutPoint {
    type Err = WalletError;

    /// Parses `txid_hex:n`.
    fn from_str(s: &str) -> Result<Self> {
        let (txid_hex, n) = s
            .rsplit_once(':')
            .ok_or_else(|| WalletError::Validation(format!("outpoint {} is not txid:n", s)))?;
        let bytes = hex::decode(txid_hex)?;
        let txid: Txid = bytes
            .try_into()
            .map_err(|_| WalletError::Validation(format!("txid {} is not 32 bytes", txid_hex)))?;
        let n = n
            .parse::<u32>()
            .map_err(|e| WalletError::Validation(format!("output index {}: {}", n, e)))?;
        Ok(OutPoint { txid, n })
    }
}

/// A transaction output. Each construction and serialization site matches
/// every variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOut {
    Plain {
        value: Amount,
        script: Vec<u8>,
    },
    Blinded {
        commitment: Commitment,
        script: Vec<u8>,
        data: Vec<u8>,
        range_proof: Vec<u8>,
    },
    Anonymous {
        #[serde(with = "BigArray")]
        pubkey: CompressedPubKey,
        commitment: Commitment,
        data: Vec<u8>,
        range_proof: Vec<u8>,
    },
}

impl TxOut {
    pub fn output_type(&self) -> OutputType {
        match self {
            TxOut::Plain { .. } => OutputType::Standard,
            TxOut::Blinded { .. } => OutputType::Blind,
            TxOut::Anonymous { .. } => OutputType::Anon,
        }
    }

    pub fn commitment(&self) -> Option<&Commitment> {
        match self {
            TxOut::Plain { .. } => None,
            TxOut::Blinded { commitment, .. } | TxOut::Anonymous { commitment, .. } => Some(commitment),
        }
    }

    pub fn range_proof(&self) -> Option<&[u8]> {
        match self {
            TxOut::Plain { .. } => None,
            TxOut::Blinded { range_proof, .. } | TxOut::Anonymous { range_proof, .. } => Some(range_proof),
        }
    }

    pub fn plain_value(&self) -> Option<Amount> {
        match self {
            TxOut::Plain { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// Ring of global anonymous-output indices with one real column per row.
///
/// `rows[i][c]` is the index used by input `i` in ring column `c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingInputs {
    pub ring_size: usize,
    pub inputs_per_sig: usize,
    pub rows: Vec<Vec<i64>>,
    pub key_images: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxIn {
    Standard { prevout: OutPoint },
    Anon(RingInputs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub lock_time: u32,
    pub fee: Amount,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn txid(&self) -> Txid {
        // only fixed-shape fields and byte vectors, no maps or unsized values
        let bytes = bincode::serialize(self).expect("transaction serializes with bincode");
        blake3_hash(&bytes)
    }
}
