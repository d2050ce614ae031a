//! Removal of superseded block versions.
//!
//! Each committed batch merges the offsets it rewrote into the file's
//! [`PurgeLedger`]. A purge pass consumes the ledger and deletes, for every
//! recorded offset, the versions strictly older than the recorded one. It
//! holds the file `Exclusive` while doing so, which guarantees no reader is
//! still resolving an older block 0.

use futures::future::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{Backend, Mode, Transaction};
use crate::block::KeyRange;
use crate::config::{PurgeConfig, PurgeMode, VfsConfig};
use crate::context::TxnContext;
use crate::error::{Error, Result};
use crate::lock::{LockLevel, LockManager, NamedLocks};
use crate::scheduler::{BackgroundTask, Context, Scheduler};

/// Offsets rewritten by committed batches, each with the newest version
/// written there.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeLedger {
    pages: BTreeMap<u64, i64>,
}

impl PurgeLedger {
    pub fn record(&mut self, offset: u64, version: i64) {
        self.pages
            .entry(offset)
            .and_modify(|v| *v = (*v).min(version))
            .or_insert(version);
    }

    pub fn merge(&mut self, offsets: impl IntoIterator<Item = u64>, version: i64) {
        for offset in offsets {
            self.record(offset, version);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, i64)> + '_ {
        self.pages.iter().map(|(offset, version)| (*offset, *version))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Superseded versions were removed.
    Purged { blocks: usize },
    /// Another context held a lock on the file; the purge will be retried.
    Busy,
}

/// Deletes everything the ledger of `path` marks as superseded, then the
/// ledger itself.
pub async fn purge_ledger(txn: &mut dyn Transaction, path: &str) -> Result<usize> {
    let ledger = match txn.get_ledger(path).await? {
        Some(ledger) => ledger,
        None => return Ok(0),
    };

    let mut removed = 0;
    for (offset, version) in ledger.iter() {
        removed += txn.delete(KeyRange::older(path, offset, version)).await?;
    }
    txn.delete_ledger(path).await?;
    Ok(removed)
}

/// Schedules and runs purge passes for one [`BlockVfs`](crate::vfs::BlockVfs).
#[derive(Clone)]
pub struct Purger {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: TxnContext,
    locks: Arc<dyn NamedLocks>,
    config: PurgeConfig,
    lock_timeout: Duration,
    scheduled: Mutex<HashSet<String>>,
    busy: Mutex<HashSet<String>>,
    scheduler: Scheduler,
}

impl std::fmt::Debug for Purger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Purger")
            .field("mode", &self.inner.config.mode)
            .finish()
    }
}

impl Purger {
    /// Creates the purger and registers the sweep that retries busy files.
    pub fn new(
        backend: Arc<dyn Backend>,
        locks: Arc<dyn NamedLocks>,
        config: &VfsConfig,
    ) -> Result<Self> {
        let ctx = TxnContext::new(
            "purge",
            backend,
            config.durability,
            config.max_transaction_age,
        );
        let purger = Self {
            inner: Arc::new(Inner {
                ctx,
                locks,
                config: config.purge.clone(),
                lock_timeout: config.lock_timeout,
                scheduled: Mutex::new(HashSet::new()),
                busy: Mutex::new(HashSet::new()),
                scheduler: Scheduler::new(),
            }),
        };

        if purger.inner.config.mode == PurgeMode::Deferred {
            let task = Arc::new(PurgeTask {
                purger: Arc::downgrade(&purger.inner),
                interval: purger.inner.config.sweep_interval,
            });
            purger.inner.scheduler.register(task)?;
        }
        Ok(purger)
    }

    /// Defers a purge of `path` once its ledger has grown past the threshold.
    pub fn maybe_schedule(&self, path: &str, ledger_len: usize) -> Result<()> {
        let config = &self.inner.config;
        if config.mode != PurgeMode::Deferred || ledger_len < config.purge_at_least {
            return Ok(());
        }
        if !self.inner.scheduled.lock()?.insert(path.to_string()) {
            return Ok(());
        }

        tracing::debug!(path, pages = ledger_len, "Scheduling purge");
        let purger = self.clone();
        let path = path.to_string();
        self.inner
            .scheduler
            .spawn_after("purge", config.delay, async move {
                purger.inner.scheduled.lock()?.remove(&path);
                purger.purge(&path).await.map(|_| ())
            })
    }

    /// Runs one purge pass over `path`.
    pub async fn purge(&self, path: &str) -> Result<PurgeOutcome> {
        self.inner.purge(path).await
    }

    /// Paths whose last purge found them busy.
    pub fn busy(&self) -> Result<Vec<String>> {
        Ok(self.inner.busy.lock()?.iter().cloned().collect())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.inner.scheduler.shutdown().await?;
        self.inner.ctx.sync().await
    }
}

impl Inner {
    async fn purge(&self, path: &str) -> Result<PurgeOutcome> {
        let mut lock = LockManager::new(path, self.locks.clone(), self.lock_timeout);
        match lock.lock(LockLevel::Exclusive).await {
            Ok(()) => {}
            Err(Error::Busy) => {
                lock.unlock(LockLevel::Unlocked).await?;
                tracing::debug!(path, "File busy, deferring purge");
                self.busy.lock()?.insert(path.to_string());
                return Ok(PurgeOutcome::Busy);
            }
            Err(e) => return Err(e),
        }

        let owned = path.to_string();
        let removed = self
            .ctx
            .run(Mode::ReadWrite, move |txn| {
                let path = owned.clone();
                async move { purge_ledger(txn, &path).await }.boxed()
            })
            .await;
        let synced = self.ctx.sync().await;
        lock.unlock(LockLevel::Unlocked).await?;

        let blocks = removed?;
        synced?;
        self.busy.lock()?.remove(path);
        tracing::info!(path, blocks, "Purged superseded blocks");
        Ok(PurgeOutcome::Purged { blocks })
    }
}

/// Periodically retries purges that found their file busy.
pub struct PurgeTask {
    purger: std::sync::Weak<Inner>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for PurgeTask {
    fn name(&self) -> &'static str {
        "purge-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let inner = match self.purger.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };

        let paths: Vec<String> = inner.busy.lock()?.iter().cloned().collect();
        for path in paths {
            inner.purge(&path).await?;
        }
        Ok(())
    }
}
