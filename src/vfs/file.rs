use futures::future::FutureExt;
use std::sync::Arc;
use std::time::Instant;

use super::batch::Batch;
use super::{FileControl, OpenFlags};
use crate::backend::{Mode, Transaction};
use crate::block::{Block, BlockKey, KeyRange, Metadata, METADATA_OFFSET};
use crate::config::{Durability, VfsConfig};
use crate::context::TxnContext;
use crate::error::{Error, Result};
use crate::lock::{LockLevel, LockManager};
use crate::purge::Purger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Full,
    /// Fewer bytes than requested exist; the rest of the buffer is zeroed.
    Short,
}

/// An open file, owned by one caller.
pub struct VfsFile {
    pub(super) meta: Metadata,
    pub(super) flags: OpenFlags,
    pub(super) ctx: Arc<TxnContext>,
    pub(super) lock: LockManager,
    pub(super) purger: Purger,
    pub(super) config: VfsConfig,
    pub(super) batch: Option<Batch>,
    pub(super) overwrite: bool,
    last_sync: Option<Instant>,
    last_yield: Instant,
}

impl std::fmt::Debug for VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsFile")
            .field("path", &self.meta.path)
            .field("version", &self.meta.version)
            .field("file_size", &self.meta.file_size)
            .field("lock", &self.lock.level())
            .field("batch", &self.batch.is_some())
            .finish()
    }
}

/// Newest committed block 0 of `path`.
pub(super) async fn load_metadata(ctx: &TxnContext, path: &str) -> Result<Option<Metadata>> {
    let path = path.to_string();
    ctx.run(Mode::ReadOnly, move |txn| {
        let range = KeyRange::block(&path, METADATA_OFFSET);
        async move {
            let found = txn.get(range).await?;
            Ok::<_, Error>(found.map(|(key, block)| Metadata::from_block(key, block)))
        }
        .boxed()
    })
    .await
}

pub(super) async fn delete_file(ctx: &TxnContext, path: &str) -> Result<usize> {
    let path = path.to_string();
    ctx.run(Mode::ReadWrite, move |txn| {
        let path = path.clone();
        async move {
            let removed = txn.delete(KeyRange::file(&path)).await?;
            txn.delete_ledger(&path).await?;
            Ok::<_, Error>(removed)
        }
        .boxed()
    })
    .await
}

/// Visible version of the block starting at `offset`. An undecodable block
/// reads as missing.
async fn lookup(
    txn: &mut dyn Transaction,
    path: &str,
    offset: u64,
    version: i64,
) -> Result<Option<Block>> {
    match txn.get(KeyRange::visible(path, offset, version)).await {
        Ok(found) => Ok(found.map(|(_, block)| block)),
        Err(e) if e.is_corruption() => {
            tracing::warn!(path, offset, error = %e, "Undecodable block");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Reads the contiguous bytes of `[start, end)` that exist at `version`,
/// stopping at the first gap.
async fn read_range(
    txn: &mut dyn Transaction,
    path: &str,
    version: i64,
    start: u64,
    end: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((end - start) as usize);
    let mut pos = start;

    while pos < end {
        let (block_offset, block) = match lookup(txn, path, pos, version).await? {
            Some(block) => (pos, block),
            None => {
                // the block holding `pos` starts earlier
                let holder = match txn.get_last_key(KeyRange::before(path, pos)).await? {
                    Some(key) if key.offset != METADATA_OFFSET => key.offset,
                    _ => break,
                };
                match lookup(txn, path, holder, version).await? {
                    Some(block) => (holder, block),
                    None => break,
                }
            }
        };

        let within = (pos - block_offset) as usize;
        if within >= block.data.len() {
            break;
        }
        let take = (block.data.len() - within).min((end - pos) as usize);
        out.extend_from_slice(&block.data[within..within + take]);
        pos += take as u64;
    }

    Ok(out)
}

impl VfsFile {
    pub(super) fn new(
        meta: Metadata,
        flags: OpenFlags,
        ctx: Arc<TxnContext>,
        lock: LockManager,
        purger: Purger,
        config: VfsConfig,
    ) -> Self {
        Self {
            meta,
            flags,
            ctx,
            lock,
            purger,
            config,
            batch: None,
            overwrite: false,
            last_sync: None,
            last_yield: Instant::now(),
        }
    }

    pub fn path(&self) -> &str {
        &self.meta.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Size recorded in the cached block 0.
    pub fn file_size(&self) -> u64 {
        self.meta.file_size
    }

    /// Version of the cached block 0.
    pub fn version(&self) -> i64 {
        self.meta.version
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }

    pub fn in_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Fills `buf` from `offset`. Bytes at or beyond the file size, or in
    /// missing blocks, read as zeros and make the read short.
    pub async fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<ReadStatus> {
        let size = self.meta.file_size;
        let end = size.min(offset.saturating_add(buf.len() as u64));
        let mut filled = 0usize;

        if offset < end {
            let head = self.meta.data.len() as u64;
            let mut pos = offset;
            if pos < head {
                let upto = end.min(head);
                let slice = &self.meta.data[pos as usize..upto as usize];
                buf[..slice.len()].copy_from_slice(slice);
                filled = slice.len();
                pos = upto;
            }

            if pos < end {
                let path = self.meta.path.clone();
                let version = self.meta.version;
                let bytes = self
                    .ctx
                    .run(Mode::ReadOnly, move |txn| {
                        let path = path.clone();
                        async move { read_range(txn, &path, version, pos, end).await }.boxed()
                    })
                    .await?;
                buf[filled..filled + bytes.len()].copy_from_slice(&bytes);
                filled += bytes.len();
            }
        }

        if filled == buf.len() {
            Ok(ReadStatus::Full)
        } else {
            buf[filled..].fill(0);
            Ok(ReadStatus::Short)
        }
    }

    pub async fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if self.flags.contains(OpenFlags::READONLY) {
            return Err(Error::InvalidOperation(format!(
                "{} is open read-only",
                self.meta.path
            )));
        }

        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            Error::InvalidOperation(format!("write past the end of {}", self.meta.path))
        })?;
        let size_changed = end > self.meta.file_size;
        if size_changed {
            self.meta.file_size = end;
        }

        let head = self.meta.data.len() as u64;
        let touches_block0 = offset == METADATA_OFFSET || offset < head;
        if offset == METADATA_OFFSET {
            self.meta.data = data.to_vec();
        } else if offset < head {
            let (start, end) = (offset as usize, end as usize);
            if self.meta.data.len() < end {
                self.meta.data.resize(end, 0);
            }
            self.meta.data[start..end].copy_from_slice(data);
        } else {
            let key = BlockKey::new(self.meta.path.clone(), offset, self.meta.version);
            let data = data.to_vec();
            self.ctx.queue(Mode::ReadWrite, move |txn| {
                let (key, block) = (key.clone(), Block::page(data.clone()));
                async move { txn.put(key, block).await }.boxed()
            })?;

            if let Some(batch) = self.batch.as_mut() {
                if !size_changed {
                    batch.changed.insert(offset);
                }
            }
        }

        if self.batch.is_none() && (touches_block0 || size_changed) {
            self.queue_metadata()?;
        }

        if self.last_yield.elapsed() >= self.config.write_yield_interval {
            self.ctx.drain().await?;
            tokio::task::yield_now().await;
            self.last_yield = Instant::now();
        }
        Ok(())
    }

    /// Queues a write of the cached block 0.
    pub(super) fn queue_metadata(&self) -> Result<()> {
        let (key, block) = (self.meta.key(), self.meta.to_block());
        self.ctx.queue(Mode::ReadWrite, move |txn| {
            let (key, block) = (key.clone(), block.clone());
            async move { txn.put(key, block).await }.boxed()
        })
    }

    /// Shrinks the file to `size`, dropping every block that starts at or
    /// beyond it.
    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        self.meta.file_size = size;
        if (size as usize) < self.meta.data.len() {
            self.meta.data.truncate(size as usize);
        }

        // block 0 always survives
        let range = KeyRange::from_offset(&self.meta.path, size.max(1));
        self.ctx.queue(Mode::ReadWrite, move |txn| {
            let range = range.clone();
            async move { txn.delete(range).await.map(|_| ()) }.boxed()
        })?;

        if self.batch.is_none() {
            self.queue_metadata()?;
        }
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        if self.config.durability == Durability::Relaxed {
            if let Some(last) = self.last_sync {
                if last.elapsed() < self.config.relaxed_sync_window {
                    return Ok(());
                }
            }
        }

        self.ctx.sync().await?;
        self.last_sync = Some(Instant::now());
        Ok(())
    }

    /// Escalates the lock. Reaching `Shared` from `Unlocked` reloads block 0,
    /// since another context may have committed in the meantime.
    pub async fn lock(&mut self, level: LockLevel) -> Result<()> {
        let was = self.lock.level();
        let locked = self.lock.lock(level).await;
        if was == LockLevel::Unlocked && self.lock.level() >= LockLevel::Shared {
            self.reload().await?;
        }
        locked
    }

    pub async fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.unlock(level).await
    }

    pub fn check_reserved_lock(&self) -> Result<bool> {
        self.lock.is_somewhere_reserved()
    }

    /// Replaces the cached block 0 with the newest committed one.
    pub(super) async fn reload(&mut self) -> Result<()> {
        self.meta = match load_metadata(&self.ctx, &self.meta.path).await? {
            Some(meta) => meta,
            None => Metadata::new(self.meta.path.clone()),
        };
        Ok(())
    }

    pub async fn file_control(&mut self, op: FileControl) -> Result<()> {
        match op {
            FileControl::Overwrite => {
                self.overwrite = true;
                Ok(())
            }
            FileControl::Sync | FileControl::CommitPhaseTwo => {
                if self.batch.is_none() {
                    self.finish_overwrite().await?;
                }
                Ok(())
            }
            FileControl::BeginAtomicWrite => self.begin_batch().await,
            FileControl::CommitAtomicWrite => self.commit_batch().await,
            FileControl::RollbackAtomicWrite => self.rollback_batch().await,
            FileControl::Other(op) => Err(Error::UnknownControl(op)),
        }
    }

    /// Commits outstanding work, removes the file if it was opened
    /// `DELETEONCLOSE`, and drops every lock.
    pub async fn close(mut self) -> Result<()> {
        if self.batch.is_some() {
            self.rollback_batch().await?;
        }

        let mut result = self.ctx.sync().await;
        if self.flags.contains(OpenFlags::DELETEONCLOSE) {
            let deleted = delete_file(&self.ctx, &self.meta.path).await;
            result = result.and(deleted.map(|_| ()));
            result = result.and(self.ctx.sync().await);
        }

        self.lock.unlock(LockLevel::Unlocked).await?;
        result
    }
}
