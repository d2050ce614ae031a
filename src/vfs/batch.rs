//! All-or-nothing multi-page writes.
//!
//! Beginning a batch reserves the next (smaller) version. Page writes go
//! straight to the store under that version, where readers holding the
//! previous block 0 cannot see them. Block 0 is held back in memory and
//! written last; that single write publishes the whole batch.

use futures::future::FutureExt;
use std::collections::BTreeSet;

use super::file::VfsFile;
use crate::backend::Mode;
use crate::block::{KeyRange, VersionRange, METADATA_OFFSET};
use crate::error::{Error, Result};

/// Bookkeeping of an open batch.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    /// Offsets rewritten without changing the file size.
    pub(crate) changed: BTreeSet<u64>,
}

impl VfsFile {
    pub(super) async fn begin_batch(&mut self) -> Result<()> {
        if self.batch.is_some() {
            return Err(Error::InvalidState(format!(
                "batch already open on {}",
                self.meta.path
            )));
        }

        self.meta.version -= 1;
        let path = self.meta.path.clone();
        let version = self.meta.version;

        // blocks an abandoned batch left at this version or newer
        self.ctx.queue(Mode::ReadWrite, move |txn| {
            let path = path.clone();
            async move {
                let stale = txn
                    .index_keys(VersionRange::at_or_newer(&path, version))
                    .await?;
                for key in &stale {
                    txn.delete(KeyRange::exact(key)).await?;
                }
                if !stale.is_empty() {
                    tracing::debug!(
                        path = %path,
                        version,
                        blocks = stale.len(),
                        "Cleared abandoned batch"
                    );
                }
                Ok::<(), Error>(())
            }
            .boxed()
        })?;

        self.batch = Some(Batch::default());
        tracing::debug!(path = %self.meta.path, version, "Batch begun");
        Ok(())
    }

    pub(super) async fn commit_batch(&mut self) -> Result<()> {
        let batch = self.batch.take().ok_or_else(|| {
            Error::InvalidState(format!("no batch open on {}", self.meta.path))
        })?;

        // every page must be durable before block 0 can point at it
        if let Err(e) = self.ctx.sync().await {
            tracing::warn!(path = %self.meta.path, error = %e, "Batch pages failed to commit");
            self.reload().await?;
            return Err(e);
        }

        let (key, block) = (self.meta.key(), self.meta.to_block());
        let path = self.meta.path.clone();
        let version = self.meta.version;
        let mut changed = batch.changed;
        changed.insert(METADATA_OFFSET);

        let published = self
            .ctx
            .run(Mode::ReadWrite, move |txn| {
                let (key, block, path) = (key.clone(), block.clone(), path.clone());
                let changed = changed.clone();
                async move {
                    txn.put(key, block).await?;
                    let mut ledger = txn.get_ledger(&path).await?.unwrap_or_default();
                    ledger.merge(changed, version);
                    txn.put_ledger(&path, &ledger).await?;
                    Ok::<_, Error>(ledger.len())
                }
                .boxed()
            })
            .await;
        let published = match published {
            Ok(len) => self.ctx.sync().await.map(|_| len),
            Err(e) => Err(e),
        };

        // the cache still describes the unpublished batch
        let ledger_len = match published {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(path = %self.meta.path, error = %e, "Batch failed to publish");
                self.reload().await?;
                return Err(e);
            }
        };

        tracing::debug!(path = %self.meta.path, version, "Batch committed");
        self.purger.maybe_schedule(&self.meta.path, ledger_len)?;

        if self.overwrite {
            self.finish_overwrite().await?;
        }
        Ok(())
    }

    pub(super) async fn rollback_batch(&mut self) -> Result<()> {
        if self.batch.take().is_none() {
            return Ok(());
        }
        let abandoned = self.meta.version;
        self.reload().await?;
        tracing::debug!(path = %self.meta.path, version = abandoned, "Batch rolled back");
        Ok(())
    }
}
