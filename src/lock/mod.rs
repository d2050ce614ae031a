//! The five-state file locking protocol.
//!
//! Levels are layered on three named locks per path:
//!
//! - `<path>-outer` is taken shared for a moment by every new reader and held
//!   exclusively by a writer from `Pending` onward, so no new reader can slip
//!   in while the writer waits for existing readers to leave.
//! - `<path>-inner` is held shared by every reader and exclusively by the
//!   writer at `Exclusive`.
//! - `<path>-reserved` is held exclusively by the single writer.

pub mod provider;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use provider::{FileLocks, LockGuard, LockMode, MemoryLocks, NamedLocks};

use crate::error::{Error, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Unlocked = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

impl TryFrom<i32> for LockLevel {
    type Error = Error;

    fn try_from(level: i32) -> Result<Self> {
        match level {
            0 => Ok(LockLevel::Unlocked),
            1 => Ok(LockLevel::Shared),
            2 => Ok(LockLevel::Reserved),
            3 => Ok(LockLevel::Pending),
            4 => Ok(LockLevel::Exclusive),
            other => Err(Error::InvalidOperation(format!("unknown lock level {}", other))),
        }
    }
}

/// Lock state of one open file within one execution context.
pub struct LockManager {
    path: String,
    locks: Arc<dyn NamedLocks>,
    timeout: Duration,
    level: LockLevel,
    outer: Option<LockGuard>,
    inner: Option<LockGuard>,
    reserved: Option<LockGuard>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("path", &self.path)
            .field("level", &self.level)
            .finish()
    }
}

impl LockManager {
    pub fn new(path: impl Into<String>, locks: Arc<dyn NamedLocks>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            locks,
            timeout,
            level: LockLevel::Unlocked,
            outer: None,
            inner: None,
            reserved: None,
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}-{}", self.path, suffix)
    }

    async fn acquire(&self, suffix: &str, mode: LockMode) -> Result<Option<LockGuard>> {
        let name = self.name(suffix);
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(guard) = self.locks.try_acquire(&name, mode)? {
                return Ok(Some(guard));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Escalates to `target`. Succeeds at once when already at or above it;
    /// fails with [`Error::Busy`] when a conflicting level is held elsewhere,
    /// leaving the level at whatever was reached.
    pub async fn lock(&mut self, target: LockLevel) -> Result<()> {
        if self.level >= target {
            return Ok(());
        }

        if self.level == LockLevel::Unlocked {
            self.lock_shared().await?;
        }
        if target >= LockLevel::Reserved && self.level == LockLevel::Shared {
            self.reserved = Some(
                self.acquire("reserved", LockMode::Exclusive)
                    .await?
                    .ok_or(Error::Busy)?,
            );
            self.level = LockLevel::Reserved;
        }
        if target >= LockLevel::Pending && self.level == LockLevel::Reserved {
            self.outer = Some(
                self.acquire("outer", LockMode::Exclusive)
                    .await?
                    .ok_or(Error::Busy)?,
            );
            self.level = LockLevel::Pending;
        }
        if target == LockLevel::Exclusive && self.level == LockLevel::Pending {
            self.lock_exclusive().await?;
        }

        tracing::trace!(path = %self.path, level = ?self.level, "Lock acquired");
        Ok(())
    }

    async fn lock_shared(&mut self) -> Result<()> {
        let gate = self
            .acquire("outer", LockMode::Shared)
            .await?
            .ok_or(Error::Busy)?;
        let inner = self.acquire("inner", LockMode::Shared).await?;
        drop(gate);

        self.inner = Some(inner.ok_or(Error::Busy)?);
        self.level = LockLevel::Shared;
        Ok(())
    }

    async fn lock_exclusive(&mut self) -> Result<()> {
        // our own shared hold would conflict with the exclusive one
        self.inner = None;
        match self.acquire("inner", LockMode::Exclusive).await? {
            Some(guard) => {
                self.inner = Some(guard);
                self.level = LockLevel::Exclusive;
                Ok(())
            }
            None => {
                self.inner = self.locks.try_acquire(&self.name("inner"), LockMode::Shared)?;
                if self.inner.is_none() {
                    self.release_all();
                    return Err(Error::InvalidState(format!(
                        "lost shared lock on {}",
                        self.path
                    )));
                }
                Err(Error::Busy)
            }
        }
    }

    /// De-escalates to `target`, which must be `Shared` or `Unlocked`.
    pub async fn unlock(&mut self, target: LockLevel) -> Result<()> {
        if self.level <= target {
            return Ok(());
        }

        match target {
            LockLevel::Unlocked => self.release_all(),
            LockLevel::Shared => {
                if self.level == LockLevel::Exclusive {
                    // downgrade while the outer gate still keeps others out
                    self.inner = None;
                    self.inner = self.locks.try_acquire(&self.name("inner"), LockMode::Shared)?;
                    if self.inner.is_none() {
                        self.release_all();
                        return Err(Error::InvalidState(format!(
                            "failed to downgrade lock on {}",
                            self.path
                        )));
                    }
                }
                self.outer = None;
                self.reserved = None;
                self.level = LockLevel::Shared;
            }
            other => {
                return Err(Error::InvalidOperation(format!(
                    "cannot unlock to {:?}",
                    other
                )))
            }
        }

        tracing::trace!(path = %self.path, level = ?self.level, "Lock released");
        Ok(())
    }

    fn release_all(&mut self) {
        self.inner = None;
        self.outer = None;
        self.reserved = None;
        self.level = LockLevel::Unlocked;
    }

    /// Whether any context holds a `Reserved` or higher lock on the path.
    pub fn is_somewhere_reserved(&self) -> Result<bool> {
        self.locks.is_held(&self.name("reserved"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn managers(locks: Arc<dyn NamedLocks>) -> (LockManager, LockManager) {
        (
            LockManager::new("db", locks.clone(), Duration::ZERO),
            LockManager::new("db", locks, Duration::ZERO),
        )
    }

    async fn readers_share(locks: Arc<dyn NamedLocks>) -> Result<()> {
        let (mut a, mut b) = managers(locks);
        a.lock(LockLevel::Shared).await?;
        b.lock(LockLevel::Shared).await?;
        assert_eq!(a.level(), LockLevel::Shared);
        assert_eq!(b.level(), LockLevel::Shared);
        assert!(!a.is_somewhere_reserved()?);

        a.lock(LockLevel::Reserved).await?;
        assert!(b.is_somewhere_reserved()?);
        assert!(matches!(b.lock(LockLevel::Reserved).await, Err(Error::Busy)));
        assert_eq!(b.level(), LockLevel::Shared);

        // b still reads, so a stops at pending
        assert!(matches!(a.lock(LockLevel::Exclusive).await, Err(Error::Busy)));
        assert_eq!(a.level(), LockLevel::Pending);

        // no new readers while a writer is pending
        let (mut c, _) = managers(a.locks.clone());
        assert!(matches!(c.lock(LockLevel::Shared).await, Err(Error::Busy)));

        b.unlock(LockLevel::Unlocked).await?;
        a.lock(LockLevel::Exclusive).await?;
        assert_eq!(a.level(), LockLevel::Exclusive);

        a.unlock(LockLevel::Shared).await?;
        assert_eq!(a.level(), LockLevel::Shared);
        assert!(!a.is_somewhere_reserved()?);
        c.lock(LockLevel::Shared).await?;
        assert!(matches!(c.lock(LockLevel::Exclusive).await, Err(Error::Busy)));

        a.unlock(LockLevel::Unlocked).await?;
        c.unlock(LockLevel::Unlocked).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_protocol_memory_locks() -> Result<()> {
        readers_share(Arc::new(MemoryLocks::new())).await
    }

    #[tokio::test]
    async fn test_protocol_file_locks() -> Result<()> {
        let dir = TempDir::new().unwrap();
        readers_share(Arc::new(FileLocks::new(dir.path())?)).await
    }

    #[tokio::test]
    async fn test_exclusive_blocks_readers() -> Result<()> {
        let (mut a, mut b) = managers(Arc::new(MemoryLocks::new()));
        a.lock(LockLevel::Exclusive).await?;
        assert_eq!(a.level(), LockLevel::Exclusive);
        assert!(matches!(b.lock(LockLevel::Shared).await, Err(Error::Busy)));
        assert_eq!(b.level(), LockLevel::Unlocked);

        a.unlock(LockLevel::Unlocked).await?;
        b.lock(LockLevel::Shared).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_is_monotonic() -> Result<()> {
        let (mut a, _) = managers(Arc::new(MemoryLocks::new()));
        a.lock(LockLevel::Reserved).await?;
        a.lock(LockLevel::Shared).await?;
        assert_eq!(a.level(), LockLevel::Reserved);
        a.unlock(LockLevel::Shared).await?;
        a.unlock(LockLevel::Shared).await?;
        assert_eq!(a.level(), LockLevel::Shared);
        assert!(a.unlock(LockLevel::Reserved).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_waits_for_release() -> Result<()> {
        let locks: Arc<dyn NamedLocks> = Arc::new(MemoryLocks::new());
        let mut writer = LockManager::new("db", locks.clone(), Duration::ZERO);
        let mut reader = LockManager::new("db", locks, Duration::from_millis(500));

        writer.lock(LockLevel::Exclusive).await?;
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.unlock(LockLevel::Unlocked).await
        });

        reader.lock(LockLevel::Shared).await?;
        assert_eq!(reader.level(), LockLevel::Shared);
        release.await.unwrap()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_from_spawned_task() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let locks: Arc<dyn NamedLocks> = Arc::new(FileLocks::new(dir.path())?);
        let mut writer = LockManager::new("db", locks.clone(), Duration::ZERO);
        writer.lock(LockLevel::Exclusive).await?;

        // the retry loop sleeps while borrowing the manager
        let mut reader = LockManager::new("db", locks, Duration::from_millis(500));
        let waiting = tokio::spawn(async move {
            reader.lock(LockLevel::Shared).await?;
            Ok::<_, Error>(reader.level())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.unlock(LockLevel::Unlocked).await?;
        assert_eq!(waiting.await.unwrap()?, LockLevel::Shared);
        Ok(())
    }

    #[test]
    fn test_level_from_code() {
        assert_eq!(LockLevel::try_from(4).unwrap(), LockLevel::Exclusive);
        assert!(LockLevel::try_from(5).is_err());
        assert!(LockLevel::Pending > LockLevel::Reserved);
    }
}
