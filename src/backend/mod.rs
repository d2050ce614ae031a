//! The asynchronous, transactional store blocks are persisted in.
//!
//! The store exposes one object store of blocks keyed by
//! `(path, offset, version)`, a secondary index on `(path, version)`, and a
//! small side table holding each file's purge ledger. All access happens
//! inside a [`Transaction`] opened in a [`Mode`].

pub mod journal;
pub mod memory;

pub use memory::MemoryBackend;

use crate::block::{Block, BlockKey, KeyRange, VersionRange};
use crate::config::Durability;
use crate::error::Result;
use crate::purge::PurgeLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

impl Mode {
    /// Whether a transaction opened in `self` can serve a request for `other`.
    pub fn covers(self, other: Mode) -> bool {
        self == Mode::ReadWrite || other == Mode::ReadOnly
    }
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Opens a transaction. Read-write transactions are exclusive; read-only
    /// transactions never observe uncommitted effects.
    async fn begin(&self, mode: Mode, durability: Durability) -> Result<Box<dyn Transaction>>;
}

#[async_trait::async_trait]
pub trait Transaction: Send {
    fn mode(&self) -> Mode;

    /// First block in the range.
    async fn get(&mut self, range: KeyRange) -> Result<Option<(BlockKey, Block)>>;

    /// Last block in the range.
    async fn get_last(&mut self, range: KeyRange) -> Result<Option<(BlockKey, Block)>>;

    /// Blocks in the range in key order, at most `limit` of them.
    async fn get_all(
        &mut self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(BlockKey, Block)>>;

    async fn get_key(&mut self, range: KeyRange) -> Result<Option<BlockKey>>;

    async fn get_last_key(&mut self, range: KeyRange) -> Result<Option<BlockKey>>;

    async fn get_all_keys(&mut self, range: KeyRange, limit: Option<usize>)
        -> Result<Vec<BlockKey>>;

    /// Keys found through the `(path, version)` index, ordered by version.
    async fn index_keys(&mut self, range: VersionRange) -> Result<Vec<BlockKey>>;

    async fn put(&mut self, key: BlockKey, block: Block) -> Result<()>;

    /// Deletes every block in the range, returning how many were removed.
    async fn delete(&mut self, range: KeyRange) -> Result<usize>;

    /// Removes every block and ledger.
    async fn clear(&mut self) -> Result<()>;

    async fn get_ledger(&mut self, path: &str) -> Result<Option<PurgeLedger>>;

    async fn put_ledger(&mut self, path: &str, ledger: &PurgeLedger) -> Result<()>;

    async fn delete_ledger(&mut self, path: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>);
}
