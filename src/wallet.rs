use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::chain::ChainView;
use crate::crypto::verify_commitment;
use crate::error::{Result, WalletError};
use crate::recipient::Destination;
use crate::records::{Amount, OutputRecord, OutputType, StoredTransaction, TransactionRecord, Txid, UNKNOWN_VALUE};
use crate::storage::{self, KvStore, WriteTxn};
use crate::transaction::OutPoint;

/// A wallet shared between callers. Every ledger, selection and build
/// operation runs while holding this mutex.
pub type WalletHandle = Arc<Mutex<Wallet>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBookEntry {
    pub label: String,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub output_type: OutputType,
    pub value: Amount,
    pub depth: i32,
    pub is_change: bool,
    pub narration: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balances {
    pub plain: Amount,
    pub plain_unconfirmed: Amount,
    pub blind: Amount,
    pub blind_unconfirmed: Amount,
    pub anon: Amount,
    pub anon_unconfirmed: Amount,
    pub watch_only: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlindAuditIssue {
    MissingStoredTransaction(Txid),
    MissingBlind(OutPoint),
    CommitmentMismatch(OutPoint),
}

impl std::fmt::Display for BlindAuditIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlindAuditIssue::MissingStoredTransaction(txid) => {
                write!(f, "stored transaction missing for {}", hex::encode(txid))
            }
            BlindAuditIssue::MissingBlind(op) => write!(f, "blinding factor missing for {}", op),
            BlindAuditIssue::CommitmentMismatch(op) => write!(f, "stored blind does not reopen {}", op),
        }
    }
}

/// In-memory changes applied only after the database commit succeeds.
#[derive(Default)]
struct Staged {
    records: Vec<(Txid, TransactionRecord)>,
    removed: Vec<Txid>,
    locked_add: Vec<OutPoint>,
    locked_remove: Vec<OutPoint>,
    unlock_all: bool,
}

pub struct Wallet {
    name: String,
    store: Arc<dyn KvStore>,
    records: BTreeMap<Txid, TransactionRecord>,
    spent_by: HashMap<OutPoint, Txid>,
    locked_coins: BTreeSet<OutPoint>,
    locked: bool,
    address_book: BTreeMap<Destination, AddressBookEntry>,
    ownership_cache: HashMap<Destination, bool>,
}

impl Wallet {
    /// Loads every transaction record, re-derives block heights from the
    /// chain view and rebuilds the spend map and locked outpoint set.
    pub fn open(name: &str, store: Arc<dyn KvStore>, chain: &dyn ChainView) -> Result<Self> {
        let mut records = BTreeMap::new();
        for (key, mut record) in store.scan::<TransactionRecord>(storage::KEY_RECORD)? {
            let txid = storage::txid_from_key(storage::KEY_RECORD, &key)
                .ok_or_else(|| WalletError::Persistence(format!("malformed record key {}", hex::encode(&key))))?;
            record.block_height = if record.hash_unset() {
                0
            } else {
                chain.block_height(&record.block_hash).unwrap_or(0)
            };
            records.insert(txid, record);
        }

        let mut locked_coins = BTreeSet::new();
        for (key, _) in store.scan_prefix(storage::KEY_LOCKED_UNSPENT)? {
            match key.strip_prefix(storage::KEY_LOCKED_UNSPENT).and_then(OutPoint::from_key) {
                Some(op) => {
                    locked_coins.insert(op);
                }
                None => warn!(wallet = name, key = %hex::encode(&key), "skipping malformed lock entry"),
            }
        }

        let mut wallet = Wallet {
            name: name.to_string(),
            store,
            records,
            spent_by: HashMap::new(),
            locked_coins,
            locked: false,
            address_book: BTreeMap::new(),
            ownership_cache: HashMap::new(),
        };
        wallet.rebuild_spent_map();
        info!(
            wallet = name,
            records = wallet.records.len(),
            locked_coins = wallet.locked_coins.len(),
            "wallet opened"
        );
        Ok(wallet)
    }

    pub fn into_handle(self) -> WalletHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn rebuild_spent_map(&mut self) {
        self.spent_by.clear();
        for (txid, record) in &self.records {
            if record.is_abandoned() || record.is_conflicted() {
                continue;
            }
            for input in &record.inputs {
                self.spent_by.insert(*input, *txid);
            }
        }
    }

    pub fn records(&self) -> &BTreeMap<Txid, TransactionRecord> {
        &self.records
    }

    pub fn record(&self, txid: &Txid) -> Option<&TransactionRecord> {
        self.records.get(txid)
    }

    pub fn spent_by(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.spent_by.get(outpoint).copied()
    }

    pub fn stored_transaction(&self, txid: &Txid) -> Result<Option<StoredTransaction>> {
        self.store.read(&storage::stored_key(txid))
    }

    /// Confirmations of a record: 0 while unconfirmed, -1 once abandoned or
    /// conflicted.
    pub fn depth(&self, record: &TransactionRecord, chain: &dyn ChainView) -> i32 {
        if record.is_abandoned() || record.is_conflicted() {
            return -1;
        }
        if record.hash_unset() {
            return 0;
        }
        match chain.block_height(&record.block_hash) {
            Some(height) => (chain.tip_height() - height + 1).max(0),
            None => 0,
        }
    }

    fn run_txn<F>(&mut self, op: &str, stage: F) -> Result<()>
    where
        F: FnOnce(&Wallet, &mut WriteTxn, &mut Staged) -> Result<()>,
    {
        let store = Arc::clone(&self.store);
        let mut txn = store.txn_begin();
        let mut staged = Staged::default();
        if let Err(e) = stage(self, &mut txn, &mut staged) {
            warn!(wallet = %self.name, op, error = %e, "aborting wallet update");
            store.txn_abort(txn);
            return Err(e);
        }
        if let Err(e) = store.txn_commit(txn) {
            crate::metrics::DB_TXN_ABORTS.inc();
            warn!(wallet = %self.name, op, error = %e, "wallet commit failed");
            return Err(e);
        }
        self.apply(staged);
        Ok(())
    }

    fn apply(&mut self, staged: Staged) {
        for txid in staged.removed {
            self.records.remove(&txid);
        }
        for (txid, record) in staged.records {
            self.records.insert(txid, record);
        }
        if staged.unlock_all {
            self.locked_coins.clear();
        }
        for op in staged.locked_remove {
            self.locked_coins.remove(&op);
        }
        self.locked_coins.extend(staged.locked_add);
        self.rebuild_spent_map();
    }

    /// Working copy of a record, preferring one already staged in this txn.
    fn staged_record(&self, staged: &Staged, txid: &Txid) -> Option<TransactionRecord> {
        staged
            .records
            .iter()
            .rev()
            .find(|(t, _)| t == txid)
            .map(|(_, r)| r.clone())
            .or_else(|| self.records.get(txid).cloned())
    }

    fn stage_record(&self, txn: &mut WriteTxn, staged: &mut Staged, txid: Txid, record: TransactionRecord) -> Result<()> {
        txn.put(storage::record_key(&txid), &record)?;
        staged.records.retain(|(t, _)| *t != txid);
        staged.records.push((txid, record));
        Ok(())
    }

    fn stage_spent_flags(&self, txn: &mut WriteTxn, staged: &mut Staged, inputs: &[OutPoint], spent: bool) -> Result<()> {
        for input in inputs {
            let Some(mut prev) = self.staged_record(staged, &input.txid) else {
                continue;
            };
            let Ok(n) = u16::try_from(input.n) else {
                continue;
            };
            if let Ok(out) = prev.get_output_mut(n) {
                if out.is_spent() != spent {
                    out.set_spent(spent);
                    self.stage_record(txn, staged, input.txid, prev)?;
                }
            }
        }
        Ok(())
    }

    /// Persists a record (and its stored transaction) and marks the outputs it
    /// spends, in one database transaction.
    ///
    /// An existing record for `txid` is merged: block position and value map
    /// are taken from the new record and its outputs replace by index.
    pub fn add_to_record(
        &mut self,
        txid: Txid,
        record: TransactionRecord,
        stored: Option<StoredTransaction>,
    ) -> Result<()> {
        if let Some(stx) = &stored {
            if stx.txid() != txid {
                return Err(WalletError::Validation(format!(
                    "stored transaction does not hash to {}",
                    hex::encode(txid)
                )));
            }
        }
        self.run_txn("add_to_record", |w, txn, staged| {
            let merged = match w.records.get(&txid) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merged.block_hash = record.block_hash;
                    merged.block_height = record.block_height;
                    merged.index = record.index;
                    merged.block_time = record.block_time;
                    merged.flags |= record.flags;
                    merged.value_map.extend(record.value_map.clone());
                    if merged.fee == 0 {
                        merged.fee = record.fee;
                    }
                    if merged.inputs.is_empty() {
                        merged.inputs = record.inputs.clone();
                    }
                    for out in &record.outputs {
                        merged.insert_output(out.clone(), true)?;
                    }
                    merged
                }
                None => record,
            };
            let inputs = merged.inputs.clone();
            w.stage_record(txn, staged, txid, merged)?;
            if let Some(stx) = &stored {
                txn.put(storage::stored_key(&txid), stx)?;
            }
            w.stage_spent_flags(txn, staged, &inputs, true)?;
            for input in &inputs {
                if w.locked_coins.contains(input) {
                    txn.delete(storage::locked_key(input));
                    staged.locked_remove.push(*input);
                }
            }
            Ok(())
        })?;
        info!(wallet = %self.name, txid = %hex::encode(txid), "transaction record added");
        Ok(())
    }

    /// Folds a freshly built transaction into the ledger.
    pub fn commit_transaction(&mut self, built: &crate::builder::BuiltTransaction) -> Result<Txid> {
        let txid = built.txid;
        self.add_to_record(txid, built.record.clone(), Some(built.stored.clone()))?;
        Ok(txid)
    }

    /// Only unconfirmed, non-abandoned records can be abandoned. Frees the
    /// outputs the transaction spent.
    pub fn abandon_transaction(&mut self, txid: &Txid) -> Result<()> {
        let record = self
            .records
            .get(txid)
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hex::encode(txid))))?;
        if record.is_abandoned() {
            return Err(WalletError::Validation(format!("transaction {} is already abandoned", hex::encode(txid))));
        }
        if !record.hash_unset() {
            return Err(WalletError::Validation(format!("transaction {} is confirmed", hex::encode(txid))));
        }
        let txid = *txid;
        self.run_txn("abandon", |w, txn, staged| {
            let mut updated = w.staged_record(staged, &txid).unwrap_or_default();
            updated.set_abandoned();
            let inputs = updated.inputs.clone();
            w.stage_record(txn, staged, txid, updated)?;
            let freed: Vec<OutPoint> = inputs.into_iter().filter(|i| w.spent_by(i) == Some(txid)).collect();
            w.stage_spent_flags(txn, staged, &freed, false)
        })?;
        info!(wallet = %self.name, txid = %hex::encode(txid), "transaction abandoned");
        Ok(())
    }

    pub fn mark_conflicted(&mut self, txid: &Txid) -> Result<()> {
        let txid = *txid;
        let mut record = self
            .records
            .get(&txid)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hex::encode(txid))))?;
        record.set_conflicted();
        self.run_txn("mark_conflicted", |w, txn, staged| {
            let freed: Vec<OutPoint> = record.inputs.iter().copied().filter(|i| w.spent_by(i) == Some(txid)).collect();
            w.stage_record(txn, staged, txid, record)?;
            w.stage_spent_flags(txn, staged, &freed, false)
        })?;
        debug!(wallet = %self.name, txid = %hex::encode(txid), "transaction marked conflicted");
        Ok(())
    }

    /// Rewrites the block position of a record after a reorg.
    pub fn set_merkle_branch(
        &mut self,
        txid: &Txid,
        block_hash: [u8; 32],
        index: i16,
        block_time: i64,
        chain: &dyn ChainView,
    ) -> Result<()> {
        let txid = *txid;
        let mut record = self
            .records
            .get(&txid)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hex::encode(txid))))?;
        let was_conflicted = record.is_conflicted();
        let height = chain.block_height(&block_hash).unwrap_or(0);
        record.set_merkle_branch(block_hash, index, height, block_time);
        self.run_txn("set_merkle_branch", |w, txn, staged| {
            let respent = if was_conflicted && !record.is_conflicted() && !record.is_abandoned() {
                record.inputs.clone()
            } else {
                Vec::new()
            };
            w.stage_record(txn, staged, txid, record)?;
            w.stage_spent_flags(txn, staged, &respent, true)
        })
    }

    /// Erases the record and its stored transaction.
    pub fn purge_transaction(&mut self, txid: &Txid) -> Result<()> {
        let txid = *txid;
        let record = self
            .records
            .get(&txid)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hex::encode(txid))))?;
        self.run_txn("purge", |w, txn, staged| {
            txn.delete(storage::record_key(&txid));
            txn.delete(storage::stored_key(&txid));
            staged.removed.push(txid);
            let freed: Vec<OutPoint> = record
                .inputs
                .iter()
                .copied()
                .filter(|i| w.spent_by(i) == Some(txid))
                .collect();
            w.stage_spent_flags(txn, staged, &freed, false)?;
            for op in w.locked_coins.iter().filter(|op| op.txid == txid) {
                txn.delete(storage::locked_key(op));
                staged.locked_remove.push(*op);
            }
            Ok(())
        })?;
        info!(wallet = %self.name, txid = %hex::encode(txid), "transaction purged");
        Ok(())
    }

    /// Drops blinds of spent outputs from a stored transaction.
    pub fn prune_stored_blinds(&mut self, txid: &Txid) -> Result<usize> {
        let record = self
            .records
            .get(txid)
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hex::encode(txid))))?;
        let mut stored = self
            .stored_transaction(txid)?
            .ok_or_else(|| WalletError::NotFound(format!("stored transaction {}", hex::encode(txid))))?;
        let spent: Vec<u32> = record.outputs.iter().filter(|o| o.is_spent()).map(|o| o.n as u32).collect();
        let pruned = stored.prune_blinds(&spent);
        if pruned > 0 {
            let key = storage::stored_key(txid);
            self.run_txn("prune_blinds", |_, txn, _| txn.put(key, &stored))?;
        }
        Ok(pruned)
    }

    /// Records the key image of an owned anonymous output so its spend can
    /// be looked up on chain.
    pub fn set_key_image(&mut self, outpoint: &OutPoint, key_image: Vec<u8>) -> Result<()> {
        let record = self
            .records
            .get(&outpoint.txid)
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hex::encode(outpoint.txid))))?;
        let n = u16::try_from(outpoint.n).map_err(|_| WalletError::NotFound(format!("output {}", outpoint)))?;
        if record.get_output(n)?.output_type != OutputType::Anon {
            return Err(WalletError::Validation(format!("output {} is not anonymous", outpoint)));
        }
        if key_image.is_empty() {
            return Err(WalletError::Validation("empty key image".into()));
        }
        let mut stored = self
            .stored_transaction(&outpoint.txid)?
            .ok_or_else(|| WalletError::NotFound(format!("stored transaction {}", hex::encode(outpoint.txid))))?;
        stored.insert_key_image(outpoint.n, key_image);
        let key = storage::stored_key(&outpoint.txid);
        self.run_txn("set_key_image", |_, txn, _| txn.put(key, &stored))
    }

    pub fn lock_coin(&mut self, outpoint: OutPoint) -> Result<()> {
        self.run_txn("lock_coin", |_, txn, staged| {
            txn.put_raw(storage::locked_key(&outpoint), Vec::new());
            staged.locked_add.push(outpoint);
            Ok(())
        })
    }

    pub fn unlock_coin(&mut self, outpoint: &OutPoint) -> Result<()> {
        let outpoint = *outpoint;
        self.run_txn("unlock_coin", |_, txn, staged| {
            txn.delete(storage::locked_key(&outpoint));
            staged.locked_remove.push(outpoint);
            Ok(())
        })
    }

    pub fn unlock_all(&mut self) -> Result<()> {
        self.run_txn("unlock_all", |w, txn, staged| {
            for op in &w.locked_coins {
                txn.delete(storage::locked_key(op));
            }
            staged.unlock_all = true;
            Ok(())
        })
    }

    pub fn is_locked_coin(&self, outpoint: &OutPoint) -> bool {
        self.locked_coins.contains(outpoint)
    }

    pub fn list_locked(&self) -> Vec<OutPoint> {
        self.locked_coins.iter().copied().collect()
    }

    /// Locks the wallet's secret material. The keys themselves live outside
    /// this crate.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn owned_unspent(&self, chain: &dyn ChainView) -> Vec<(OutPoint, &OutputRecord, i32)> {
        let mut out = Vec::new();
        for (txid, record) in &self.records {
            let depth = self.depth(record, chain);
            if depth < 0 {
                continue;
            }
            for o in &record.outputs {
                if o.is_placeholder() || o.is_spent() || o.value == UNKNOWN_VALUE {
                    continue;
                }
                if !(o.is_owned() || o.is_watch_only()) {
                    continue;
                }
                let op = OutPoint::new(*txid, o.n as u32);
                if self.spent_by.contains_key(&op) {
                    continue;
                }
                out.push((op, o, depth));
            }
        }
        out
    }

    pub fn balances(&self, chain: &dyn ChainView) -> Balances {
        let mut b = Balances::default();
        for (_, o, depth) in self.owned_unspent(chain) {
            if !o.is_owned() {
                b.watch_only += o.value;
                continue;
            }
            let confirmed = depth > 0;
            let slot = match (o.output_type, confirmed) {
                (OutputType::Standard, true) => &mut b.plain,
                (OutputType::Standard, false) => &mut b.plain_unconfirmed,
                (OutputType::Blind, true) => &mut b.blind,
                (OutputType::Blind, false) => &mut b.blind_unconfirmed,
                (OutputType::Anon, true) => &mut b.anon,
                (OutputType::Anon, false) => &mut b.anon_unconfirmed,
            };
            *slot += o.value;
        }
        b
    }

    pub fn blind_balance(&self, chain: &dyn ChainView) -> Amount {
        self.balances(chain).blind
    }

    pub fn anon_balance(&self, chain: &dyn ChainView) -> Amount {
        self.balances(chain).anon
    }

    pub fn plain_balance(&self, chain: &dyn ChainView) -> Amount {
        self.balances(chain).plain
    }

    pub fn list_unspent(&self, kind: OutputType, chain: &dyn ChainView) -> Vec<UnspentOutput> {
        self.owned_unspent(chain)
            .into_iter()
            .filter(|(_, o, _)| o.output_type == kind && o.is_owned())
            .map(|(outpoint, o, depth)| UnspentOutput {
                outpoint,
                output_type: o.output_type,
                value: o.value,
                depth,
                is_change: o.is_change(),
                narration: o.narration.clone(),
            })
            .collect()
    }

    /// Scripts that have already been spent from.
    pub fn used_scripts(&self) -> HashSet<Vec<u8>> {
        self.records
            .values()
            .flat_map(|r| r.outputs.iter())
            .filter(|o| o.is_owned() && o.is_spent() && !o.script.is_empty())
            .map(|o| o.script.clone())
            .collect()
    }

    /// Owned or from-self shielded outputs whose blind is missing or does not
    /// reopen the commitment in the stored transaction.
    pub fn audit_stored_blinds(&self) -> Result<Vec<BlindAuditIssue>> {
        let mut issues = Vec::new();
        for (txid, record) in &self.records {
            let needs_blinds = record
                .outputs
                .iter()
                .any(|o| o.is_shielded() && !o.is_placeholder() && (o.is_owned() || o.is_from_me()));
            if !needs_blinds {
                continue;
            }
            let Some(stored) = self.stored_transaction(txid)? else {
                issues.push(BlindAuditIssue::MissingStoredTransaction(*txid));
                continue;
            };
            for n in stored.missing_blinds(record) {
                issues.push(BlindAuditIssue::MissingBlind(OutPoint::new(*txid, n as u32)));
            }
            for o in record.outputs.iter().filter(|o| o.is_shielded() && o.value != UNKNOWN_VALUE) {
                let (Some(blind), Some(out)) = (stored.get_blind(o.n as u32), stored.tx.outputs.get(o.n as usize)) else {
                    continue;
                };
                if let Some(commitment) = out.commitment() {
                    if !verify_commitment(commitment, blind, o.value as u64) {
                        issues.push(BlindAuditIssue::CommitmentMismatch(OutPoint::new(*txid, o.n as u32)));
                    }
                }
            }
        }
        if !issues.is_empty() {
            warn!(wallet = %self.name, issues = issues.len(), "stored blind audit found problems");
        }
        Ok(issues)
    }

    pub fn set_address_book(&mut self, dest: Destination, label: &str, purpose: &str) {
        self.address_book.insert(
            dest,
            AddressBookEntry { label: label.to_string(), purpose: purpose.to_string() },
        );
    }

    pub fn address_book(&self) -> impl Iterator<Item = (&Destination, &AddressBookEntry)> {
        self.address_book.iter()
    }

    /// Write-through ownership cache, updated outside any address-book iteration.
    pub fn mark_ownership_computed(&mut self, dest: Destination, owned: bool) {
        self.ownership_cache.insert(dest, owned);
    }

    pub fn cached_ownership(&self, dest: &Destination) -> Option<bool> {
        self.ownership_cache.get(dest).copied()
    }

    /// Computes ownership for every address-book entry not yet cached.
    pub fn refresh_address_book_ownership<F>(&mut self, is_mine: F)
    where
        F: Fn(&Destination) -> bool,
    {
        let pending: Vec<Destination> = self
            .address_book
            .keys()
            .filter(|d| !self.ownership_cache.contains_key(*d))
            .cloned()
            .collect();
        for dest in pending {
            let owned = is_mine(&dest);
            self.mark_ownership_computed(dest, owned);
        }
    }
}
