//! The in-process backing store.
//!
//! Blocks, the `(path, version)` index and purge ledgers live in lock-free
//! skip maps. Transactions are isolated with a gate: a read-write
//! transaction holds it exclusively, read-only transactions share it. Writes
//! are applied in place and undone if the transaction aborts or expires.
//!
//! When a directory is configured, every commit is appended to a
//! [`Journal`] and the journal is replayed and compacted on open.

use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::journal::{Journal, Record};
use super::{Backend, Mode, Transaction};
use crate::block::{Block, BlockKey, KeyRange, VersionRange};
use crate::config::{BackendConfig, Durability};
use crate::encoding::{Key, Value};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::purge::PurgeLedger;

const JOURNAL_FILE: &str = "blocks.journal";
const LOCK_FILE: &str = "LOCK";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub commits: u64,
    pub aborts: u64,
    pub expired: u64,
    pub blocks: usize,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    aborts: AtomicU64,
    expired: AtomicU64,
}

struct Shared {
    blocks: SkipMap<Vec<u8>, Vec<u8>>,
    index: SkipMap<Vec<u8>, ()>,
    ledgers: SkipMap<String, Vec<u8>>,
    gate: Arc<RwLock<()>>,
    journal: Option<Mutex<Journal>>,
    config: BackendConfig,
    counters: Counters,
    _lock: Option<FileLock>,
}

impl Shared {
    fn insert_block(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let index_key = BlockKey::decode(&key)?.index_key();
        self.index.insert(index_key, ());
        self.blocks.insert(key, value);
        Ok(())
    }

    fn remove_block(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let previous = self.blocks.remove(key).map(|e| e.value().clone());
        if previous.is_some() {
            self.index.remove(&BlockKey::decode(key)?.index_key());
        }
        Ok(previous)
    }

    fn apply(&self, record: Record) -> Result<()> {
        match record {
            Record::Block {
                key,
                value: Some(value),
            } => self.insert_block(key, value),
            Record::Block { key, value: None } => self.remove_block(&key).map(|_| ()),
            Record::Ledger {
                key,
                value: Some(value),
            } => {
                self.ledgers.insert(ledger_path(&key)?, value);
                Ok(())
            }
            Record::Ledger { key, value: None } => {
                self.ledgers.remove(&ledger_path(&key)?);
                Ok(())
            }
            Record::Commit => Ok(()),
        }
    }

    fn snapshot(&self) -> Vec<Record> {
        let blocks = self.blocks.iter().map(|e| Record::Block {
            key: e.key().clone(),
            value: Some(e.value().clone()),
        });
        let ledgers = self.ledgers.iter().map(|e| Record::Ledger {
            key: e.key().as_bytes().to_vec(),
            value: Some(e.value().clone()),
        });
        blocks.chain(ledgers).collect()
    }
}

fn ledger_path(key: &[u8]) -> Result<String> {
    String::from_utf8(key.to_vec())
        .map_err(|_| Error::InvalidData("ledger key is not utf-8".to_string()))
}

/// Transactional block store kept in memory and optionally journaled to disk.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("dir", &self.shared.config.dir)
            .field("blocks", &self.shared.blocks.len())
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// A volatile store.
    pub fn new() -> Self {
        Self::build(BackendConfig::in_memory(), None, None)
    }

    /// Opens a store with the given configuration, replaying its journal if
    /// a directory is configured.
    pub fn open(config: BackendConfig) -> Result<Self> {
        let dir = match config.dir.clone() {
            Some(dir) => dir,
            None => return Ok(Self::build(config, None, None)),
        };

        std::fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        let path = dir.join(JOURNAL_FILE);
        let backend = Self::build(config.clone(), None, Some(lock));
        let txns = Journal::replay(&path)?;
        let replayed = txns.len();
        for record in txns.into_iter().flatten() {
            backend.shared.apply(record)?;
        }

        let journal = Journal::rewrite(&path, backend.shared.snapshot(), config.journal_buffer_size)?;
        tracing::info!(
            path = %path.display(),
            transactions = replayed,
            blocks = backend.shared.blocks.len(),
            "Recovered block store"
        );

        let Shared {
            blocks,
            index,
            ledgers,
            _lock,
            ..
        } = Arc::try_unwrap(backend.shared)
            .map_err(|_| Error::InvalidState("store shared during recovery".to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                blocks,
                index,
                ledgers,
                gate: Arc::new(RwLock::new(())),
                journal: Some(Mutex::new(journal)),
                config,
                counters: Counters::default(),
                _lock,
            }),
        })
    }

    fn build(config: BackendConfig, journal: Option<Journal>, lock: Option<FileLock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                blocks: SkipMap::new(),
                index: SkipMap::new(),
                ledgers: SkipMap::new(),
                gate: Arc::new(RwLock::new(())),
                journal: journal.map(Mutex::new),
                config,
                counters: Counters::default(),
                _lock: lock,
            }),
        }
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            commits: self.shared.counters.commits.load(Ordering::Relaxed),
            aborts: self.shared.counters.aborts.load(Ordering::Relaxed),
            expired: self.shared.counters.expired.load(Ordering::Relaxed),
            blocks: self.shared.blocks.len(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn begin(&self, mode: Mode, durability: Durability) -> Result<Box<dyn Transaction>> {
        let guard = match mode {
            Mode::ReadOnly => Guard::Read(self.shared.gate.clone().read_owned().await),
            Mode::ReadWrite => Guard::Write(self.shared.gate.clone().write_owned().await),
        };

        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            mode,
            durability,
            started: Instant::now(),
            undo: Vec::new(),
            records: Vec::new(),
            active: true,
            _guard: guard,
        }))
    }
}

enum Guard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

enum Undo {
    Block {
        key: Vec<u8>,
        previous: Option<Vec<u8>>,
    },
    Ledger {
        path: String,
        previous: Option<Vec<u8>>,
    },
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    mode: Mode,
    durability: Durability,
    started: Instant,
    undo: Vec<Undo>,
    records: Vec<Record>,
    active: bool,
    _guard: Guard,
}

impl MemoryTransaction {
    fn check(&mut self) -> Result<()> {
        if !self.active {
            return Err(Error::TransactionInactive);
        }
        if let Some(expiry) = self.shared.config.transaction_expiry {
            if self.started.elapsed() >= expiry {
                tracing::debug!(mode = ?self.mode, "Transaction expired");
                self.shared.counters.expired.fetch_add(1, Ordering::Relaxed);
                self.rollback();
                return Err(Error::TransactionInactive);
            }
        }
        Ok(())
    }

    fn check_writable(&mut self) -> Result<()> {
        self.check()?;
        if self.mode != Mode::ReadWrite {
            return Err(Error::InvalidOperation(
                "write in a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn rollback(&mut self) {
        for undo in self.undo.drain(..).rev() {
            let restored = match undo {
                Undo::Block {
                    key,
                    previous: Some(value),
                } => self.shared.insert_block(key, value),
                Undo::Block {
                    key,
                    previous: None,
                } => self.shared.remove_block(&key).map(|_| ()),
                Undo::Ledger {
                    path,
                    previous: Some(value),
                } => {
                    self.shared.ledgers.insert(path, value);
                    Ok(())
                }
                Undo::Ledger {
                    path,
                    previous: None,
                } => {
                    self.shared.ledgers.remove(&path);
                    Ok(())
                }
            };
            if let Err(e) = restored {
                tracing::error!(error = %e, "Failed to undo block write");
            }
        }
        self.records.clear();
        self.active = false;
    }

    fn scan(&self, range: &KeyRange) -> impl DoubleEndedIterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.shared
            .blocks
            .range(range.encode())
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    fn remove(&mut self, key: Vec<u8>) -> Result<bool> {
        let previous = self.shared.remove_block(&key)?;
        let removed = previous.is_some();
        if removed {
            self.undo.push(Undo::Block {
                key: key.clone(),
                previous,
            });
            self.records.push(Record::Block { key, value: None });
        }
        Ok(removed)
    }

    fn set_ledger(&mut self, path: &str, value: Option<Vec<u8>>) {
        let previous = match &value {
            Some(v) => {
                let previous = self.shared.ledgers.get(path).map(|e| e.value().clone());
                self.shared.ledgers.insert(path.to_string(), v.clone());
                previous
            }
            None => self.shared.ledgers.remove(path).map(|e| e.value().clone()),
        };
        self.undo.push(Undo::Ledger {
            path: path.to_string(),
            previous,
        });
        self.records.push(Record::Ledger {
            key: path.as_bytes().to_vec(),
            value,
        });
    }
}

fn decode_entry((key, value): (Vec<u8>, Vec<u8>)) -> Result<(BlockKey, Block)> {
    Ok((BlockKey::decode(&key)?, Block::decode(&value)?))
}

#[async_trait::async_trait]
impl Transaction for MemoryTransaction {
    fn mode(&self) -> Mode {
        self.mode
    }

    async fn get(&mut self, range: KeyRange) -> Result<Option<(BlockKey, Block)>> {
        self.check()?;
        self.scan(&range).next().map(decode_entry).transpose()
    }

    async fn get_last(&mut self, range: KeyRange) -> Result<Option<(BlockKey, Block)>> {
        self.check()?;
        self.scan(&range).next_back().map(decode_entry).transpose()
    }

    async fn get_all(
        &mut self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(BlockKey, Block)>> {
        self.check()?;
        self.scan(&range)
            .take(limit.unwrap_or(usize::MAX))
            .map(decode_entry)
            .collect()
    }

    async fn get_key(&mut self, range: KeyRange) -> Result<Option<BlockKey>> {
        self.check()?;
        self.scan(&range)
            .next()
            .map(|(key, _)| BlockKey::decode(&key))
            .transpose()
    }

    async fn get_last_key(&mut self, range: KeyRange) -> Result<Option<BlockKey>> {
        self.check()?;
        self.scan(&range)
            .next_back()
            .map(|(key, _)| BlockKey::decode(&key))
            .transpose()
    }

    async fn get_all_keys(
        &mut self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<BlockKey>> {
        self.check()?;
        self.scan(&range)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, _)| BlockKey::decode(&key))
            .collect()
    }

    async fn index_keys(&mut self, range: VersionRange) -> Result<Vec<BlockKey>> {
        self.check()?;
        self.shared
            .index
            .range(range.encode())
            .map(|e| BlockKey::from_index_key(e.key()))
            .collect()
    }

    async fn put(&mut self, key: BlockKey, block: Block) -> Result<()> {
        self.check_writable()?;
        let key = key.encode();
        let value = block.encode()?;
        let previous = self.shared.blocks.get(&key).map(|e| e.value().clone());
        self.shared.insert_block(key.clone(), value.clone())?;
        self.undo.push(Undo::Block {
            key: key.clone(),
            previous,
        });
        self.records.push(Record::Block {
            key,
            value: Some(value),
        });
        Ok(())
    }

    async fn delete(&mut self, range: KeyRange) -> Result<usize> {
        self.check_writable()?;
        let keys: Vec<_> = self.scan(&range).map(|(key, _)| key).collect();
        let mut removed = 0;
        for key in keys {
            if self.remove(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear(&mut self) -> Result<()> {
        self.check_writable()?;
        let keys: Vec<_> = self.shared.blocks.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(key)?;
        }
        let paths: Vec<_> = self.shared.ledgers.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            self.set_ledger(&path, None);
        }
        Ok(())
    }

    async fn get_ledger(&mut self, path: &str) -> Result<Option<PurgeLedger>> {
        self.check()?;
        match self.shared.ledgers.get(path) {
            Some(entry) => Ok(Some(PurgeLedger::decode(entry.value())?)),
            None => Ok(None),
        }
    }

    async fn put_ledger(&mut self, path: &str, ledger: &PurgeLedger) -> Result<()> {
        self.check_writable()?;
        let value = ledger.encode()?;
        self.set_ledger(path, Some(value));
        Ok(())
    }

    async fn delete_ledger(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        if self.shared.ledgers.contains_key(path) {
            self.set_ledger(path, None);
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.check()?;

        let shared = self.shared.clone();
        if !self.records.is_empty() {
            if let Some(journal) = &shared.journal {
                let written = journal.lock().map_err(Error::from).and_then(|mut journal| {
                    journal.append_transaction(&self.records)?;
                    if self.durability == Durability::Strict {
                        journal.sync()?;
                    }
                    Ok(())
                });
                if let Err(e) = written {
                    tracing::error!(error = %e, "Failed to journal transaction");
                    self.rollback();
                    self.shared.counters.aborts.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        self.undo.clear();
        self.records.clear();
        self.active = false;
        self.shared.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        if self.active {
            self.rollback();
            self.shared.counters.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.active && !self.undo.is_empty() {
            tracing::debug!("Rolling back dropped transaction");
            self.rollback();
            self.shared.counters.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn begin(backend: &MemoryBackend, mode: Mode) -> Box<dyn Transaction> {
        backend.begin(mode, Durability::Default).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_commit() -> Result<()> {
        let backend = MemoryBackend::new();

        let mut txn = begin(&backend, Mode::ReadWrite).await;
        txn.put(BlockKey::new("db", 4096, 0), Block::page(vec![1; 16]))
            .await?;
        txn.put(BlockKey::new("db", 4096, -1), Block::page(vec![2; 16]))
            .await?;
        txn.commit().await?;

        let mut txn = begin(&backend, Mode::ReadOnly).await;
        let (key, block) = txn.get(KeyRange::block("db", 4096)).await?.unwrap();
        assert_eq!(key.version, -1);
        assert_eq!(block.data, vec![2; 16]);

        let (key, _) = txn.get(KeyRange::visible("db", 4096, 0)).await?.unwrap();
        assert_eq!(key.version, 0);

        let (key, _) = txn.get_last(KeyRange::block("db", 4096)).await?.unwrap();
        assert_eq!(key.version, 0);
        txn.commit().await?;

        assert_eq!(backend.stats().commits, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_restores_previous_state() -> Result<()> {
        let backend = MemoryBackend::new();

        let mut txn = begin(&backend, Mode::ReadWrite).await;
        txn.put(BlockKey::new("db", 0, 0), Block::page(vec![1]))
            .await?;
        txn.commit().await?;

        let mut txn = begin(&backend, Mode::ReadWrite).await;
        txn.put(BlockKey::new("db", 0, 0), Block::page(vec![9]))
            .await?;
        txn.put(BlockKey::new("db", 512, 0), Block::page(vec![9]))
            .await?;
        txn.abort().await;

        let mut txn = begin(&backend, Mode::ReadOnly).await;
        let all = txn.get_all(KeyRange::file("db"), None).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.data, vec![1]);
        assert_eq!(txn.index_keys(VersionRange::all("db")).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() -> Result<()> {
        let backend = MemoryBackend::new();
        {
            let mut txn = begin(&backend, Mode::ReadWrite).await;
            txn.put(BlockKey::new("db", 0, 0), Block::page(vec![1]))
                .await?;
        }
        assert_eq!(backend.stats().blocks, 0);
        assert_eq!(backend.stats().aborts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let backend = MemoryBackend::new();
        let mut txn = begin(&backend, Mode::ReadOnly).await;
        let result = txn.put(BlockKey::new("db", 0, 0), Block::page(vec![])).await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_readers_wait_for_writer() -> Result<()> {
        let backend = MemoryBackend::new();
        let mut writer = begin(&backend, Mode::ReadWrite).await;
        writer
            .put(BlockKey::new("db", 0, 0), Block::page(vec![5]))
            .await?;

        let reader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let mut txn = begin(&backend, Mode::ReadOnly).await;
                txn.get(KeyRange::block("db", 0)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        writer.commit().await?;
        let (_, block) = reader.await.unwrap()?.unwrap();
        assert_eq!(block.data, vec![5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_transaction_rolls_back() -> Result<()> {
        let backend =
            MemoryBackend::open(BackendConfig::in_memory().transaction_expiry(Duration::from_millis(10)))?;

        let mut txn = begin(&backend, Mode::ReadWrite).await;
        txn.put(BlockKey::new("db", 0, 0), Block::page(vec![1]))
            .await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = txn.put(BlockKey::new("db", 512, 0), Block::page(vec![1])).await;
        assert!(matches!(result, Err(Error::TransactionInactive)));
        assert!(matches!(txn.commit().await, Err(Error::TransactionInactive)));

        assert_eq!(backend.stats().blocks, 0);
        assert_eq!(backend.stats().expired, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_range_and_index() -> Result<()> {
        let backend = MemoryBackend::new();
        let mut txn = begin(&backend, Mode::ReadWrite).await;
        for offset in [0u64, 512, 1024, 1536] {
            txn.put(BlockKey::new("db", offset, -1), Block::page(vec![0; 512]))
                .await?;
        }
        txn.put(BlockKey::new("db", 512, 0), Block::page(vec![0; 512]))
            .await?;
        txn.put(BlockKey::new("other", 512, 0), Block::page(vec![0; 512]))
            .await?;

        let older = txn.index_keys(VersionRange::older("db", -1)).await?;
        assert_eq!(older, vec![BlockKey::new("db", 512, 0)]);

        assert_eq!(txn.delete(KeyRange::from_offset("db", 1024)).await?, 2);
        assert_eq!(txn.delete(KeyRange::older("db", 512, -1)).await?, 1);

        let keys = txn.get_all_keys(KeyRange::file("db"), None).await?;
        assert_eq!(
            keys,
            vec![BlockKey::new("db", 0, -1), BlockKey::new("db", 512, -1)]
        );
        assert_eq!(txn.get_all_keys(KeyRange::file("other"), Some(5)).await?.len(), 1);
        txn.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_ledger_roundtrip() -> Result<()> {
        let backend = MemoryBackend::new();
        let mut ledger = PurgeLedger::default();
        ledger.record(4096, -2);

        let mut txn = begin(&backend, Mode::ReadWrite).await;
        assert!(txn.get_ledger("db").await?.is_none());
        txn.put_ledger("db", &ledger).await?;
        assert_eq!(txn.get_ledger("db").await?, Some(ledger.clone()));
        txn.delete_ledger("db").await?;
        assert!(txn.get_ledger("db").await?.is_none());
        txn.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_recovery() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = BackendConfig::new(dir.path());

        {
            let backend = MemoryBackend::open(config.clone())?;
            let mut txn = backend.begin(Mode::ReadWrite, Durability::Strict).await?;
            txn.put(BlockKey::new("db", 0, 0), Block {
                data: vec![3; 8],
                file_size: Some(8),
            })
            .await?;
            let mut ledger = PurgeLedger::default();
            ledger.record(512, -1);
            txn.put_ledger("db", &ledger).await?;
            txn.commit().await?;

            let mut txn = backend.begin(Mode::ReadWrite, Durability::Strict).await?;
            txn.put(BlockKey::new("db", 512, 0), Block::page(vec![4; 8]))
                .await?;
            txn.abort().await;
        }

        let backend = MemoryBackend::open(config)?;
        let mut txn = begin(&backend, Mode::ReadOnly).await;
        let all = txn.get_all(KeyRange::file("db"), None).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.file_size, Some(8));
        assert!(txn.get_ledger("db").await?.is_some());
        assert_eq!(txn.index_keys(VersionRange::all("db")).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_is_locked() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let _backend = MemoryBackend::open(BackendConfig::new(dir.path()))?;
        let second = MemoryBackend::open(BackendConfig::new(dir.path()));
        assert!(matches!(second, Err(Error::LockError(_))));
        Ok(())
    }
}
