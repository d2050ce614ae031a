pub mod backend;
pub mod block;
pub mod bridge;
pub mod config;
pub mod context;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod lock;
pub mod purge;
pub mod scheduler;
pub mod vfs;

pub use backend::{Backend, MemoryBackend, Mode, Transaction};
pub use bridge::{ResultCode, SyncFile, SyncVfs};
pub use config::{BackendConfig, Durability, PurgeConfig, PurgeMode, VfsConfig};
pub use error::{Error, Result};
pub use lock::{FileLocks, LockLevel, MemoryLocks, NamedLocks};
pub use purge::PurgeOutcome;
pub use vfs::{BlockVfs, FileControl, OpenFlags, ReadStatus, VfsFile};
