//! Named lock primitives shared by every execution context that opens the
//! same store.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::flock::FileLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held named lock. Dropping the guard releases it.
pub struct LockGuard {
    name: String,
    mode: LockMode,
    _held: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    pub fn new(
        name: impl Into<String>,
        mode: LockMode,
        held: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            _held: held,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Acquire/hold/release by name, in shared or exclusive mode. Acquisition
/// never waits: a conflicting holder yields `None`.
pub trait NamedLocks: Send + Sync {
    fn try_acquire(&self, name: &str, mode: LockMode) -> Result<Option<LockGuard>>;

    /// Whether anyone, including the caller, holds `name` in any mode.
    fn is_held(&self, name: &str) -> Result<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
struct Holders {
    shared: usize,
    exclusive: bool,
}

type Registry = Arc<Mutex<HashMap<String, Holders>>>;

/// Named locks for contexts living in one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocks {
    registry: Registry,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryRelease {
    registry: Registry,
    name: String,
    mode: LockMode,
}

impl Drop for MemoryRelease {
    fn drop(&mut self) {
        let mut registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(holders) = registry.get_mut(&self.name) {
            match self.mode {
                LockMode::Shared => holders.shared = holders.shared.saturating_sub(1),
                LockMode::Exclusive => holders.exclusive = false,
            }
            if holders.shared == 0 && !holders.exclusive {
                registry.remove(&self.name);
            }
        }
    }
}

impl NamedLocks for MemoryLocks {
    fn try_acquire(&self, name: &str, mode: LockMode) -> Result<Option<LockGuard>> {
        let mut registry = self.registry.lock()?;
        let holders = registry.entry(name.to_string()).or_default();

        let granted = match mode {
            LockMode::Shared if !holders.exclusive => {
                holders.shared += 1;
                true
            }
            LockMode::Exclusive if !holders.exclusive && holders.shared == 0 => {
                holders.exclusive = true;
                true
            }
            _ => false,
        };
        if !granted {
            return Ok(None);
        }

        let release = MemoryRelease {
            registry: self.registry.clone(),
            name: name.to_string(),
            mode,
        };
        Ok(Some(LockGuard::new(name, mode, Box::new(release))))
    }

    fn is_held(&self, name: &str) -> Result<bool> {
        let registry = self.registry.lock()?;
        Ok(registry
            .get(name)
            .is_some_and(|h| h.exclusive || h.shared > 0))
    }
}

/// Named locks backed by `flock` on one file per name, visible across
/// processes sharing `dir`.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        // names are arbitrary file paths
        self.dir.join(format!("{}.lock", hex::encode(name)))
    }
}

impl NamedLocks for FileLocks {
    fn try_acquire(&self, name: &str, mode: LockMode) -> Result<Option<LockGuard>> {
        let lock = FileLock::try_lock(self.lock_path(name), mode).map_err(Error::LockError)?;
        Ok(lock.map(|lock| LockGuard::new(name, mode, Box::new(lock))))
    }

    /// `flock` cannot report a holder without taking the lock, so this
    /// holds an exclusive lock on the name for the duration of the call. A
    /// `try_acquire` from another process in that instant sees a conflict.
    fn is_held(&self, name: &str) -> Result<bool> {
        let attempt = FileLock::try_lock(self.lock_path(name), LockMode::Exclusive)
            .map_err(Error::LockError)?;
        Ok(attempt.is_none())
    }
}
