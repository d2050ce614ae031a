//! Re-chunking a file after its page size changed.
//!
//! When a rewrite changes the page size, the engine still writes the new
//! content in chunks of the old size and only the database header records the
//! new one. Once the rewrite ends the blocks are rebuilt at the new size.

use futures::future::FutureExt;

use super::file::VfsFile;
use crate::backend::{Mode, Transaction};
use crate::block::{Block, BlockKey, KeyRange, METADATA_OFFSET};
use crate::error::Result;

const PAGE_SIZE_OFFSET: usize = 16;
const PAGE_COUNT_OFFSET: usize = 28;
const HEADER_LEN: usize = 32;

/// Page size recorded in a database header, if `header` holds one.
pub fn page_size(header: &[u8]) -> Option<u64> {
    if header.len() < HEADER_LEN {
        return None;
    }
    let raw = u16::from_be_bytes([header[PAGE_SIZE_OFFSET], header[PAGE_SIZE_OFFSET + 1]]);
    match raw {
        0 => None,
        1 => Some(65536),
        size => Some(size as u64),
    }
}

/// Page count recorded in a database header, if `header` holds one.
pub fn page_count(header: &[u8]) -> Option<u64> {
    if header.len() < HEADER_LEN {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&header[PAGE_COUNT_OFFSET..PAGE_COUNT_OFFSET + 4]);
    Some(u32::from_be_bytes(raw) as u64)
}

/// Deletes every version of every block except the one visible at `version`.
async fn drop_other_versions(txn: &mut dyn Transaction, path: &str, version: i64) -> Result<usize> {
    let keys = txn.get_all_keys(KeyRange::file(path), None).await?;
    let mut current = None;
    let mut removed = 0;
    for key in keys {
        if key.version < version || current == Some(key.offset) {
            removed += txn.delete(KeyRange::exact(&key)).await?;
        } else {
            current = Some(key.offset);
        }
    }
    Ok(removed)
}

/// Rebuilds the blocks of `[start, start + chunk)` at `new_size` pages and
/// returns the rebuilt block 0, if this chunk holds it.
async fn rechunk(
    txn: &mut dyn Transaction,
    path: &str,
    version: i64,
    start: u64,
    chunk: u64,
    new_size: u64,
    file_size: u64,
) -> Result<Option<Vec<u8>>> {
    let len = chunk.min(file_size - start) as usize;
    let mut buf = vec![0u8; len];
    let end = start + chunk;

    for (key, block) in txn.get_all(KeyRange::offsets(path, start, end), None).await? {
        let at = (key.offset - start) as usize;
        if at >= len {
            continue;
        }
        let take = block.data.len().min(len - at);
        buf[at..at + take].copy_from_slice(&block.data[..take]);
    }
    txn.delete(KeyRange::offsets(path, start, end)).await?;

    let mut block0 = None;
    for (i, page) in buf.chunks(new_size as usize).enumerate() {
        let offset = start + i as u64 * new_size;
        if offset == METADATA_OFFSET {
            // written last, with the new size
            block0 = Some(page.to_vec());
            continue;
        }
        txn.put(BlockKey::new(path, offset, version), Block::page(page.to_vec())).await?;
    }
    Ok(block0)
}

/// Rewrites every block of `path` at `new_size` pages inside one
/// transaction, given the cached block 0 as `head`. Returns the new block 0.
async fn reblock_file(
    txn: &mut dyn Transaction,
    path: &str,
    version: i64,
    head: Block,
    old_size: u64,
    new_size: u64,
    file_size: u64,
) -> Result<Vec<u8>> {
    // block 0 may only live in the cache so far
    let fallback = head.data.clone();
    txn.put(BlockKey::new(path, METADATA_OFFSET, version), head).await?;
    let removed = drop_other_versions(txn, path, version).await?;

    let chunk = old_size.max(new_size);
    let mut data = fallback;
    let mut start = 0;
    while start < file_size {
        if let Some(block0) =
            rechunk(txn, path, version, start, chunk, new_size, file_size).await?
        {
            data = block0;
        }
        start += chunk;
    }

    txn.delete(KeyRange::from_offset(path, file_size.max(1))).await?;
    let block0 = Block {
        data: data.clone(),
        file_size: Some(file_size),
    };
    txn.put(BlockKey::new(path, METADATA_OFFSET, version), block0).await?;
    tracing::debug!(path, removed, "Dropped superseded versions");
    Ok(data)
}

impl VfsFile {
    /// Ends a destructive rewrite, rebuilding the blocks if it changed the
    /// page size. The rewrite stays pending until the rebuild commits.
    pub(super) async fn finish_overwrite(&mut self) -> Result<()> {
        if !self.overwrite {
            return Ok(());
        }

        let old_size = self.meta.data.len() as u64;
        match page_size(&self.meta.data) {
            Some(new_size) if new_size != old_size => self.reblock(old_size, new_size).await?,
            _ => {}
        }
        self.overwrite = false;
        Ok(())
    }

    async fn reblock(&mut self, old_size: u64, new_size: u64) -> Result<()> {
        let path = self.meta.path.clone();
        let version = self.meta.version;
        let file_size = match page_count(&self.meta.data) {
            Some(count) => count * new_size,
            None => self.meta.file_size,
        };
        tracing::info!(path = %path, old_size, new_size, file_size, "Reblocking file");

        // queued writes commit on their own so a failed rebuild aborts nothing else
        self.ctx.sync().await?;

        let head = self.meta.to_block();
        let owned = path.clone();
        let rebuilt = self
            .ctx
            .run(Mode::ReadWrite, move |txn| {
                let (path, head) = (owned.clone(), head.clone());
                async move {
                    reblock_file(txn, &path, version, head, old_size, new_size, file_size).await
                }
                .boxed()
            })
            .await;
        let rebuilt = match rebuilt {
            Ok(data) => self.ctx.sync().await.map(|_| data),
            Err(e) => Err(e),
        };

        match rebuilt {
            Ok(data) => {
                self.meta.data = data;
                self.meta.file_size = file_size;
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Reblocking failed");
                Err(e)
            }
        }
    }
}
