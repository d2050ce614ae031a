use std::path::PathBuf;
use std::time::Duration;

/// How hard `sync` works to make committed data durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Commit the pending transaction at every sync.
    #[default]
    Default,
    /// Commit and fsync the journal at every sync.
    Strict,
    /// Skip a sync when the previous one finished within
    /// `VfsConfig::relaxed_sync_window`.
    Relaxed,
}

/// When superseded block versions are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurgeMode {
    /// Purge in the background once a file's ledger crosses the threshold.
    #[default]
    Deferred,
    /// Only purge when `BlockVfs::purge` is called.
    Manual,
}

/// Configuration for the VFS layer
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Durability applied at sync (default: Default)
    pub durability: Durability,

    /// Window in which a relaxed sync may be skipped (default: 1s)
    pub relaxed_sync_window: Duration,

    /// Age after which an open backend transaction is committed and
    /// replaced instead of being reused (default: 4s)
    pub max_transaction_age: Duration,

    /// How often a burst of writes yields back to the scheduler (default: 2s)
    pub write_yield_interval: Duration,

    /// How long a lock transition may wait on transient contention before
    /// reporting busy (default: 0, try once)
    pub lock_timeout: Duration,

    /// Purge configuration
    pub purge: PurgeConfig,
}

#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Deferred or manual purging (default: Deferred)
    pub mode: PurgeMode,

    /// Ledger size (in pages) that triggers a deferred purge (default: 16)
    pub purge_at_least: usize,

    /// Delay before a scheduled purge runs (default: 100ms)
    pub delay: Duration,

    /// How often purges that found the file busy are retried (default: 30s)
    pub sweep_interval: Duration,
}

/// Configuration for the in-process backing store
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Journal directory; `None` keeps everything in memory (default: None)
    pub dir: Option<PathBuf>,

    /// Age after which the store silently expires a transaction (default: never)
    pub transaction_expiry: Option<Duration>,

    /// Journal buffer size (default: 64KB)
    pub journal_buffer_size: usize,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            mode: PurgeMode::Deferred,
            purge_at_least: 16,
            delay: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            durability: Durability::Default,
            relaxed_sync_window: Duration::from_secs(1),
            max_transaction_age: Duration::from_secs(4),
            write_yield_interval: Duration::from_secs(2),
            lock_timeout: Duration::ZERO,
            purge: PurgeConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dir: None,
            transaction_expiry: None,
            journal_buffer_size: 64 * 1024, // 64KB
        }
    }
}

impl VfsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sync durability
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Set the relaxed sync window
    pub fn relaxed_sync_window(mut self, window: Duration) -> Self {
        self.relaxed_sync_window = window;
        self
    }

    /// Set the transaction refresh budget
    pub fn max_transaction_age(mut self, age: Duration) -> Self {
        self.max_transaction_age = age;
        self
    }

    /// Set the write yield interval
    pub fn write_yield_interval(mut self, interval: Duration) -> Self {
        self.write_yield_interval = interval;
        self
    }

    /// Set the lock wait budget
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Configure purging
    pub fn purge(mut self, config: PurgeConfig) -> Self {
        self.purge = config;
        self
    }
}

impl PurgeConfig {
    /// Set the purge mode
    pub fn mode(mut self, mode: PurgeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the ledger threshold
    pub fn purge_at_least(mut self, pages: usize) -> Self {
        self.purge_at_least = pages;
        self
    }

    /// Set the deferral delay
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the busy-retry sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

impl BackendConfig {
    /// Create a durable config journaling into the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Keep everything in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set the transaction expiry
    pub fn transaction_expiry(mut self, expiry: Duration) -> Self {
        self.transaction_expiry = Some(expiry);
        self
    }

    /// Set the journal buffer size
    pub fn journal_buffer_size(mut self, size: usize) -> Self {
        self.journal_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VfsConfig::default();
        assert_eq!(config.durability, Durability::Default);
        assert_eq!(config.max_transaction_age, Duration::from_secs(4));
        assert_eq!(config.write_yield_interval, Duration::from_secs(2));
        assert_eq!(config.lock_timeout, Duration::ZERO);

        // Test default purge config
        assert_eq!(config.purge.mode, PurgeMode::Deferred);
        assert_eq!(config.purge.purge_at_least, 16);
        assert_eq!(config.purge.delay, Duration::from_millis(100));

        let backend = BackendConfig::default();
        assert!(backend.dir.is_none());
        assert!(backend.transaction_expiry.is_none());
        assert_eq!(backend.journal_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = VfsConfig::new()
            .durability(Durability::Relaxed)
            .relaxed_sync_window(Duration::from_millis(250))
            .max_transaction_age(Duration::from_millis(500))
            .write_yield_interval(Duration::from_millis(50))
            .lock_timeout(Duration::from_millis(20))
            .purge(
                PurgeConfig::default()
                    .mode(PurgeMode::Manual)
                    .purge_at_least(4)
                    .delay(Duration::from_millis(5))
                    .sweep_interval(Duration::from_secs(1)),
            );

        assert_eq!(config.durability, Durability::Relaxed);
        assert_eq!(config.relaxed_sync_window, Duration::from_millis(250));
        assert_eq!(config.max_transaction_age, Duration::from_millis(500));
        assert_eq!(config.write_yield_interval, Duration::from_millis(50));
        assert_eq!(config.lock_timeout, Duration::from_millis(20));

        assert_eq!(config.purge.mode, PurgeMode::Manual);
        assert_eq!(config.purge.purge_at_least, 4);
        assert_eq!(config.purge.delay, Duration::from_millis(5));
        assert_eq!(config.purge.sweep_interval, Duration::from_secs(1));

        let backend = BackendConfig::new("/tmp/blocks")
            .transaction_expiry(Duration::from_millis(30))
            .journal_buffer_size(4096);
        assert_eq!(backend.dir, Some(PathBuf::from("/tmp/blocks")));
        assert_eq!(backend.transaction_expiry, Some(Duration::from_millis(30)));
        assert_eq!(backend.journal_buffer_size, 4096);
    }
}
