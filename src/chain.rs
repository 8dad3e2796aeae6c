//! Read-only view of chain state consumed by the wallet core.

use std::collections::{HashMap, HashSet};

use crate::crypto::CompressedPubKey;
use crate::records::Txid;
use crate::transaction::OutPoint;

pub trait ChainView: Send + Sync {
    fn tip_height(&self) -> i32;

    /// Height of a block on the active chain, `None` if unknown or orphaned.
    fn block_height(&self, block_hash: &[u8; 32]) -> Option<i32>;

    /// Global index of an anonymous output, looked up by its public key.
    fn read_rct_output_link(&self, pubkey: &CompressedPubKey) -> Option<i64>;

    /// Transaction that spent the key image, if any.
    fn read_rct_key_image(&self, key_image: &[u8]) -> Option<Txid>;

    /// Size of the global anonymous-output index space. Indices run `1..=count`.
    fn anon_output_count(&self) -> i64;

    fn is_blacklisted_anon_output(&self, index: i64) -> bool;
    fn is_whitelisted_anon_output(&self, index: i64) -> bool;
    fn is_frozen_anon_output(&self, index: i64) -> bool;
    fn is_frozen_blind_output(&self, txid: &Txid) -> bool;
    fn is_whitelisted_blind_output(&self, outpoint: &OutPoint) -> bool;
}

/// In-memory chain view.
#[derive(Debug, Default, Clone)]
pub struct MemoryChain {
    pub tip: i32,
    pub blocks: HashMap<[u8; 32], i32>,
    pub anon_links: HashMap<CompressedPubKey, i64>,
    pub key_images: HashMap<Vec<u8>, Txid>,
    pub anon_count: i64,
    pub blacklisted_anon: HashSet<i64>,
    pub whitelisted_anon: HashSet<i64>,
    pub frozen_anon: HashSet<i64>,
    pub frozen_blind_txs: HashSet<Txid>,
    pub whitelisted_blind: HashSet<OutPoint>,
}

impl MemoryChain {
    pub fn new(tip: i32) -> Self {
        MemoryChain { tip, ..Default::default() }
    }

    pub fn add_block(&mut self, hash: [u8; 32], height: i32) {
        self.blocks.insert(hash, height);
        self.tip = self.tip.max(height);
    }

    /// Registers the next global anonymous index for `pubkey` and returns it.
    pub fn push_anon_output(&mut self, pubkey: CompressedPubKey) -> i64 {
        self.anon_count += 1;
        self.anon_links.insert(pubkey, self.anon_count);
        self.anon_count
    }
}

impl ChainView for MemoryChain {
    fn tip_height(&self) -> i32 {
        self.tip
    }

    fn block_height(&self, block_hash: &[u8; 32]) -> Option<i32> {
        self.blocks.get(block_hash).copied()
    }

    fn read_rct_output_link(&self, pubkey: &CompressedPubKey) -> Option<i64> {
        self.anon_links.get(pubkey).copied()
    }

    fn read_rct_key_image(&self, key_image: &[u8]) -> Option<Txid> {
        self.key_images.get(key_image).copied()
    }

    fn anon_output_count(&self) -> i64 {
        self.anon_count
    }

    fn is_blacklisted_anon_output(&self, index: i64) -> bool {
        self.blacklisted_anon.contains(&index)
    }

    fn is_whitelisted_anon_output(&self, index: i64) -> bool {
        self.whitelisted_anon.contains(&index)
    }

    fn is_frozen_anon_output(&self, index: i64) -> bool {
        self.frozen_anon.contains(&index)
    }

    fn is_frozen_blind_output(&self, txid: &Txid) -> bool {
        self.frozen_blind_txs.contains(txid)
    }

    fn is_whitelisted_blind_output(&self, outpoint: &OutPoint) -> bool {
        self.whitelisted_blind.contains(outpoint)
    }
}
