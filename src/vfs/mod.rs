//! The file surface an embedded SQL engine drives.
//!
//! A [`BlockVfs`] is one execution context's view of the store: it owns a
//! [`TxnContext`] shared by every file it opens and a [`Purger`] for
//! background compaction. Contexts coordinate only through the named locks
//! they are given.

mod batch;
mod file;
mod reblock;

pub use file::{ReadStatus, VfsFile};
pub use reblock::{page_count, page_size};

use bitflags::bitflags;
use futures::future::FutureExt;
use std::sync::Arc;

use crate::backend::{Backend, Mode};
use crate::block::{KeyRange, Metadata};
use crate::config::VfsConfig;
use crate::context::TxnContext;
use crate::error::{Error, Result};
use crate::lock::{LockManager, NamedLocks};
use crate::purge::{PurgeOutcome, Purger};

/// Sector size reported to the engine.
pub const SECTOR_SIZE: u32 = 512;

bitflags! {
    /// Flags passed to [`BlockVfs::open`], numbered as the engine numbers them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY = 0x0000_0001;
        const READWRITE = 0x0000_0002;
        const CREATE = 0x0000_0004;
        const DELETEONCLOSE = 0x0000_0008;
        const EXCLUSIVE = 0x0000_0010;
        const MAIN_DB = 0x0000_0100;
        const TEMP_DB = 0x0000_0200;
        const TRANSIENT_DB = 0x0000_0400;
        const MAIN_JOURNAL = 0x0000_0800;
        const TEMP_JOURNAL = 0x0000_1000;
        const SUBJOURNAL = 0x0000_2000;
        const SUPER_JOURNAL = 0x0000_4000;
        const WAL = 0x0008_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const SAFE_APPEND = 0x0000_0200;
        const SEQUENTIAL = 0x0000_0400;
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
        const BATCH_ATOMIC = 0x0000_4000;
    }
}

/// Operations of the file-control extension channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    /// A destructive rewrite of the whole file is starting.
    Overwrite,
    Sync,
    CommitPhaseTwo,
    BeginAtomicWrite,
    CommitAtomicWrite,
    RollbackAtomicWrite,
    Other(i32),
}

impl From<i32> for FileControl {
    fn from(op: i32) -> Self {
        match op {
            11 => FileControl::Overwrite,
            21 => FileControl::Sync,
            22 => FileControl::CommitPhaseTwo,
            31 => FileControl::BeginAtomicWrite,
            32 => FileControl::CommitAtomicWrite,
            33 => FileControl::RollbackAtomicWrite,
            other => FileControl::Other(other),
        }
    }
}

impl FileControl {
    pub fn code(self) -> i32 {
        match self {
            FileControl::Overwrite => 11,
            FileControl::Sync => 21,
            FileControl::CommitPhaseTwo => 22,
            FileControl::BeginAtomicWrite => 31,
            FileControl::CommitAtomicWrite => 32,
            FileControl::RollbackAtomicWrite => 33,
            FileControl::Other(op) => op,
        }
    }
}

pub struct BlockVfs {
    ctx: Arc<TxnContext>,
    locks: Arc<dyn NamedLocks>,
    purger: Purger,
    config: VfsConfig,
}

impl std::fmt::Debug for BlockVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockVfs")
            .field("context", &self.ctx.name())
            .field("config", &self.config)
            .finish()
    }
}

impl BlockVfs {
    /// Creates a context over `backend`. Must be called inside a tokio
    /// runtime, which runs the context's worker and background purges.
    pub fn new(
        backend: Arc<dyn Backend>,
        locks: Arc<dyn NamedLocks>,
        config: VfsConfig,
    ) -> Result<Self> {
        let ctx = Arc::new(TxnContext::new(
            "vfs",
            backend.clone(),
            config.durability,
            config.max_transaction_age,
        ));
        let purger = Purger::new(backend, locks.clone(), &config)?;
        Ok(Self {
            ctx,
            locks,
            purger,
            config,
        })
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<TxnContext> {
        &self.ctx
    }

    /// Opens `path`, creating an empty file when `CREATE` is set.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<VfsFile> {
        let meta = match file::load_metadata(&self.ctx, path).await? {
            Some(meta) => meta,
            None if flags.contains(OpenFlags::CREATE) => {
                let meta = Metadata::new(path);
                let (key, block) = (meta.key(), meta.to_block());
                self.ctx
                    .run(Mode::ReadWrite, move |txn| {
                        let (key, block) = (key.clone(), block.clone());
                        async move { txn.put(key, block).await }.boxed()
                    })
                    .await?;
                tracing::debug!(path, "Created file");
                meta
            }
            None => return Err(Error::CantOpen(path.to_string())),
        };

        let lock = LockManager::new(path, self.locks.clone(), self.config.lock_timeout);
        Ok(VfsFile::new(
            meta,
            flags,
            self.ctx.clone(),
            lock,
            self.purger.clone(),
            self.config.clone(),
        ))
    }

    /// Whether `path` exists.
    pub async fn access(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.ctx
            .run(Mode::ReadOnly, move |txn| {
                let range = KeyRange::block(&path, crate::block::METADATA_OFFSET);
                async move { Ok::<_, Error>(txn.get_key(range).await?.is_some()) }.boxed()
            })
            .await
    }

    /// Removes every block of `path` along with its purge ledger.
    pub async fn delete(&self, path: &str) -> Result<()> {
        file::delete_file(&self.ctx, path).await?;
        self.ctx.sync().await?;
        tracing::debug!(path, "Deleted file");
        Ok(())
    }

    /// Runs a purge pass over `path` now, whatever the purge mode.
    pub async fn purge(&self, path: &str) -> Result<PurgeOutcome> {
        self.purger.purge(path).await
    }

    pub fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    pub fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::BATCH_ATOMIC
            | DeviceCharacteristics::SAFE_APPEND
            | DeviceCharacteristics::SEQUENTIAL
            | DeviceCharacteristics::UNDELETABLE_WHEN_OPEN
    }

    /// Stops background purging and commits outstanding work.
    pub async fn shutdown(&self) -> Result<()> {
        self.purger.shutdown().await?;
        self.ctx.sync().await
    }
}
