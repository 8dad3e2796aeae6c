use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, WalletError};
use crate::records::Txid;
use crate::transaction::OutPoint;

pub const KEY_RECORD: &[u8] = b"rtx";
pub const KEY_STORED: &[u8] = b"stx";
pub const KEY_LOCKED_UNSPENT: &[u8] = b"luo";

const WALLET_CF: &str = "wallet";

pub fn record_key(txid: &Txid) -> Vec<u8> {
    [KEY_RECORD, &txid[..]].concat()
}

pub fn stored_key(txid: &Txid) -> Vec<u8> {
    [KEY_STORED, &txid[..]].concat()
}

pub fn locked_key(outpoint: &OutPoint) -> Vec<u8> {
    [KEY_LOCKED_UNSPENT, &outpoint.to_key()[..]].concat()
}

/// Strips `prefix` from a scanned key and reads the txid that follows.
pub fn txid_from_key(prefix: &[u8], key: &[u8]) -> Option<Txid> {
    key.strip_prefix(prefix).and_then(|rest| rest.try_into().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Buffered writes applied atomically by `KvStore::txn_commit`.
#[derive(Debug, Default)]
pub struct WriteTxn {
    ops: Vec<WriteOp>,
}

impl WriteTxn {
    pub fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.ops.push(WriteOp::Put(key, bytes));
        Ok(())
    }

    pub fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// Ordered key/value store with all-or-nothing write transactions.
pub trait KvStore: Send + Sync {
    fn read_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every (key, value) whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn txn_begin(&self) -> WriteTxn {
        WriteTxn::default()
    }

    fn txn_commit(&self, txn: WriteTxn) -> Result<()>;

    fn txn_abort(&self, txn: WriteTxn) {
        crate::metrics::DB_TXN_ABORTS.inc();
        debug!(pending = txn.len(), "database transaction aborted");
    }
}

impl dyn KvStore {
    pub fn read<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.read_raw(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        self.scan_prefix(prefix)?
            .into_iter()
            .map(|(k, v)| Ok((k, bincode::deserialize(&v)?)))
            .collect()
    }
}

/// RocksDB-backed wallet database.
pub struct Store {
    db: DB,
    path: String,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        let descriptors = ["default", WALLET_CF]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect::<Vec<_>>();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)
            .map_err(|e| WalletError::Persistence(format!("failed to open database at '{}': {}", path, e)))?;
        info!(path, "wallet database opened");
        Ok(Store { db, path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(WALLET_CF)
            .ok_or_else(|| WalletError::Persistence(format!("column family '{}' not found", WALLET_CF)))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }
}

impl KvStore for Store {
    fn read_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf()?, key)?)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let iter = self.db.iterator_cf(self.cf()?, IteratorMode::From(prefix, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn txn_commit(&self, txn: WriteTxn) -> Result<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for op in txn.ops {
            match op {
                WriteOp::Put(k, v) => batch.put_cf(cf, k, v),
                WriteOp::Delete(k) => batch.delete_cf(cf, k),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| WalletError::Persistence(format!("failed to commit batch: {}", e)))
    }
}

/// Ordered in-memory store for ephemeral wallets.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> WalletError {
    WalletError::Persistence("memory store lock poisoned".into())
}

impl KvStore for MemoryStore {
    fn read_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().map_err(poisoned)?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn txn_commit(&self, txn: WriteTxn) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            warn!(pending = txn.len(), "injected commit failure");
            return Err(WalletError::Persistence("commit failed".into()));
        }
        let mut data = self.data.write().map_err(poisoned)?;
        for op in txn.ops {
            match op {
                WriteOp::Put(k, v) => {
                    data.insert(k, v);
                }
                WriteOp::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }
}
