// Shared fixtures for the integration tests: a transparent range proof
// backend, a deterministic destination resolver and funded wallets.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ctwallet::chain::MemoryChain;
use ctwallet::config::{Frozen, WalletSettings};
use ctwallet::crypto::{blake3_hash, commit, BlindingFactor, Commitment, CompressedPubKey};
use ctwallet::error::{Result, WalletError};
use ctwallet::rangeproof::{RangeProofParams, RangeProofScheme, RewoundProof};
use ctwallet::recipient::{Destination, DestinationResolver, ExpandedDestination};
use ctwallet::records::{Amount, OutputRecord, OutputType, StoredTransaction, TransactionRecord, ORF_OWNED};
use ctwallet::storage::{KvStore, MemoryStore};
use ctwallet::transaction::{OutPoint, Transaction, TxIn, TxOut};
use ctwallet::wallet::Wallet;

const COMPACT_TAG: &[u8; 4] = b"CPT1";
const LEGACY_TAG: &[u8; 4] = b"LGC1";
const LEGACY_LEN: usize = 1_200;

/// Range proofs that simply carry (value, blind, message) in the clear.
/// Compact proofs stay under 1000 bytes, legacy ones are padded past it.
pub struct TransparentProofs;

fn encode_proof(tag: &[u8; 4], value: u64, blind: &BlindingFactor, nonce: &[u8; 32], message: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(tag);
    out.extend_from_slice(&value.to_le_bytes());
    out.extend_from_slice(blind.as_bytes());
    out.extend_from_slice(&blake3_hash(nonce)[..8]);
    out.extend_from_slice(&(message.len() as u16).to_le_bytes());
    out.extend_from_slice(message);
    out
}

fn decode_proof(tag: &[u8; 4], proof: &[u8], nonce: &[u8; 32]) -> Result<RewoundProof> {
    let fail = |what: &str| WalletError::RangeProof(format!("cannot rewind: {}", what));
    if proof.len() < 4 + 8 + 32 + 8 + 2 || &proof[..4] != tag {
        return Err(fail("bad header"));
    }
    let value = u64::from_le_bytes(proof[4..12].try_into().map_err(|_| fail("value"))?);
    let blind = BlindingFactor::from_slice(&proof[12..44])?;
    if proof[44..52] != blake3_hash(nonce)[..8] {
        return Err(fail("wrong nonce"));
    }
    let len = u16::from_le_bytes([proof[52], proof[53]]) as usize;
    let message = proof.get(54..54 + len).ok_or_else(|| fail("truncated message"))?.to_vec();
    Ok(RewoundProof { value, blind, message })
}

impl RangeProofScheme for TransparentProofs {
    fn prove_compact(
        &self,
        _commitment: &Commitment,
        value: u64,
        blind: &BlindingFactor,
        nonce: &[u8; 32],
        message: &[u8],
    ) -> Result<Vec<u8>> {
        Ok(encode_proof(COMPACT_TAG, value, blind, nonce, message))
    }

    fn prove_legacy(
        &self,
        _commitment: &Commitment,
        value: u64,
        blind: &BlindingFactor,
        nonce: &[u8; 32],
        message: &[u8],
        _params: &RangeProofParams,
    ) -> Result<Vec<u8>> {
        let mut proof = encode_proof(LEGACY_TAG, value, blind, nonce, message);
        proof.resize(LEGACY_LEN, 0);
        Ok(proof)
    }

    fn rewind_compact(&self, _commitment: &Commitment, proof: &[u8], nonce: &[u8; 32]) -> Result<RewoundProof> {
        decode_proof(COMPACT_TAG, proof, nonce)
    }

    fn rewind_legacy(&self, _commitment: &Commitment, proof: &[u8], nonce: &[u8; 32]) -> Result<RewoundProof> {
        decode_proof(LEGACY_TAG, proof, nonce)
    }
}

/// Pay-to-key-hash style scripts and per-call one-time keys.
#[derive(Default)]
pub struct TestResolver {
    counter: AtomicU32,
}

pub fn p2pkh(hash: &[u8]) -> Vec<u8> {
    let mut s = vec![0x76, 0xa9, 0x14];
    s.extend_from_slice(&hash[..20]);
    s.extend_from_slice(&[0x88, 0xac]);
    s
}

impl DestinationResolver for TestResolver {
    fn expand(
        &self,
        output_type: OutputType,
        destination: &Destination,
        _cold_staking: Option<&Destination>,
    ) -> Result<ExpandedDestination> {
        let script = match destination {
            Destination::None => return Err(WalletError::Validation("no destination".into())),
            Destination::Script(s) => s.clone(),
            Destination::KeyHash(h) => p2pkh(h),
            Destination::Stealth(v) | Destination::ExtKey(v) => p2pkh(&blake3_hash(v)),
        };
        let call = self.counter.fetch_add(1, Ordering::SeqCst);
        let pk_to = if output_type == OutputType::Anon {
            let mut seed = script.clone();
            seed.extend_from_slice(&call.to_le_bytes());
            Some(fake_pubkey(&seed))
        } else {
            None
        };
        Ok(ExpandedDestination {
            script: script.clone(),
            pk_to,
            ephemeral: None,
            nonce: blake3_hash(&script),
            data: Vec::new(),
            path: Vec::new(),
        })
    }

    fn change_destination(&self, _output_type: OutputType) -> Result<Destination> {
        Ok(Destination::KeyHash([0xcc; 20]))
    }
}

pub fn fake_pubkey(seed: &[u8]) -> CompressedPubKey {
    let mut pk = [0u8; 33];
    pk[0] = 0x02;
    pk[1..].copy_from_slice(&blake3_hash(seed));
    pk
}

pub fn settings() -> WalletSettings {
    WalletSettings::default()
}

pub fn frozen() -> Frozen {
    Frozen::default()
}

pub fn memory_wallet(name: &str, chain: &MemoryChain) -> (Arc<MemoryStore>, Wallet) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn KvStore> = store.clone();
    let wallet = Wallet::open(name, dyn_store, chain).expect("open memory wallet");
    (store, wallet)
}

static FUNDING_SEQ: AtomicU32 = AtomicU32::new(1);

fn next_seq() -> u32 {
    FUNDING_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// Deposit block hash for a given height.
pub fn block_hash(height: i32) -> [u8; 32] {
    blake3_hash(&height.to_le_bytes())
}

fn confirm(record: &mut TransactionRecord, chain: &mut MemoryChain, height: Option<i32>) {
    if let Some(h) = height {
        let hash = block_hash(h);
        chain.add_block(hash, h);
        record.set_merkle_branch(hash, 0, h, 1_700_000_000 + h as i64);
    }
}

/// A shielded deposit the wallet owns, with its stored blind.
pub struct Funded {
    pub outpoint: OutPoint,
    pub blind: BlindingFactor,
    pub commitment: Option<Commitment>,
    pub anon_index: Option<i64>,
}

fn external_input() -> TxIn {
    let seq = next_seq();
    TxIn::Standard { prevout: OutPoint::new(blake3_hash(&seq.to_le_bytes()), 0) }
}

pub fn fund_plain(wallet: &mut Wallet, chain: &mut MemoryChain, value: Amount, height: Option<i32>) -> Funded {
    let tx = Transaction {
        version: 2,
        lock_time: next_seq(),
        fee: 0,
        inputs: vec![external_input()],
        outputs: vec![TxOut::Plain { value, script: p2pkh(&[0x11; 20]) }],
    };
    let txid = tx.txid();
    let mut record = TransactionRecord::new(1_700_000_000);
    record
        .insert_output(OutputRecord::new(OutputType::Standard, 0, value).with_flags(ORF_OWNED), false)
        .expect("insert output");
    confirm(&mut record, chain, height);
    wallet
        .add_to_record(txid, record, Some(StoredTransaction::new(tx)))
        .expect("add plain deposit");
    Funded { outpoint: OutPoint::new(txid, 0), blind: BlindingFactor::zero(), commitment: None, anon_index: None }
}

pub fn fund_shielded(
    wallet: &mut Wallet,
    chain: &mut MemoryChain,
    output_type: OutputType,
    value: Amount,
    height: Option<i32>,
    flags: u8,
) -> Funded {
    let blind = BlindingFactor::random(&mut rand::thread_rng());
    let commitment = commit(&blind, value as u64).expect("commit");
    let seq = next_seq();
    let out = match output_type {
        OutputType::Anon => TxOut::Anonymous {
            pubkey: fake_pubkey(&seq.to_le_bytes()),
            commitment,
            data: Vec::new(),
            range_proof: Vec::new(),
        },
        _ => TxOut::Blinded { commitment, script: p2pkh(&[0x22; 20]), data: Vec::new(), range_proof: Vec::new() },
    };
    let anon_index = match &out {
        TxOut::Anonymous { pubkey, .. } => Some(chain.push_anon_output(*pubkey)),
        _ => None,
    };
    let tx = Transaction { version: 2, lock_time: seq, fee: 0, inputs: vec![external_input()], outputs: vec![out] };
    let txid = tx.txid();
    let mut stored = StoredTransaction::new(tx);
    stored.insert_blind(0, blind.clone());
    let mut record = TransactionRecord::new(1_700_000_000);
    record
        .insert_output(OutputRecord::new(output_type, 0, value).with_flags(ORF_OWNED | flags), false)
        .expect("insert output");
    confirm(&mut record, chain, height);
    wallet.add_to_record(txid, record, Some(stored)).expect("add shielded deposit");
    Funded { outpoint: OutPoint::new(txid, 0), blind, commitment: Some(commitment), anon_index }
}

pub fn fund_blind(wallet: &mut Wallet, chain: &mut MemoryChain, value: Amount, height: Option<i32>) -> Funded {
    fund_shielded(wallet, chain, OutputType::Blind, value, height, 0)
}

pub fn fund_anon(wallet: &mut Wallet, chain: &mut MemoryChain, value: Amount, height: Option<i32>) -> Funded {
    fund_shielded(wallet, chain, OutputType::Anon, value, height, 0)
}

/// Adds `n` foreign anonymous outputs to the chain's global index.
pub fn fill_anon_set(chain: &mut MemoryChain, n: usize) {
    for i in 0..n {
        let seed = format!("foreign-anon-{}-{}", chain.anon_count, i);
        chain.push_anon_output(fake_pubkey(seed.as_bytes()));
    }
}

pub fn dest(tag: u8) -> Destination {
    Destination::KeyHash([tag; 20])
}
