//! Synchronous facade for engines that cannot await.
//!
//! Every call is driven to completion on a runtime owned by the [`SyncVfs`],
//! and every failure is reported as a [`ResultCode`].

use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

use crate::backend::Backend;
use crate::config::VfsConfig;
use crate::error::{Error, Result};
use crate::lock::{LockLevel, NamedLocks};
use crate::vfs::{BlockVfs, FileControl, OpenFlags, ReadStatus, VfsFile};

/// Status codes handed back to the engine, numbered as it numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    Busy = 5,
    IoErr = 10,
    NotFound = 12,
    CantOpen = 14,
    IoErrShortRead = 522,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&Error> for ResultCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Busy => ResultCode::Busy,
            Error::CantOpen(_) => ResultCode::CantOpen,
            Error::UnknownControl(_) => ResultCode::NotFound,
            _ => ResultCode::IoErr,
        }
    }
}

fn status(result: Result<()>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::Ok,
        Err(e) => fail(e),
    }
}

fn fail(err: Error) -> ResultCode {
    let code = ResultCode::from(&err);
    if code == ResultCode::IoErr {
        tracing::warn!(error = %err, "Operation failed");
    }
    code
}

/// A [`BlockVfs`] behind blocking calls.
pub struct SyncVfs {
    vfs: BlockVfs,
    runtime: Arc<Runtime>,
}

impl SyncVfs {
    pub fn new(
        backend: Arc<dyn Backend>,
        locks: Arc<dyn NamedLocks>,
        config: VfsConfig,
    ) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("blockvfs")
            .enable_time()
            .build()?;
        let vfs = {
            let _guard = runtime.enter();
            BlockVfs::new(backend, locks, config)?
        };
        Ok(Self {
            vfs,
            runtime: Arc::new(runtime),
        })
    }

    /// Opens `path` with the engine's raw open flags.
    pub fn open(&self, path: &str, flags: i32) -> std::result::Result<SyncFile, ResultCode> {
        let flags = OpenFlags::from_bits_truncate(flags as u32);
        let file = self
            .runtime
            .block_on(self.vfs.open(path, flags))
            .map_err(fail)?;
        Ok(SyncFile {
            file,
            runtime: self.runtime.clone(),
        })
    }

    pub fn access(&self, path: &str) -> std::result::Result<bool, ResultCode> {
        self.runtime.block_on(self.vfs.access(path)).map_err(fail)
    }

    pub fn delete(&self, path: &str) -> ResultCode {
        status(self.runtime.block_on(self.vfs.delete(path)))
    }

    pub fn sector_size(&self) -> u32 {
        self.vfs.sector_size()
    }

    pub fn device_characteristics(&self) -> u32 {
        self.vfs.device_characteristics().bits()
    }

    pub fn shutdown(&self) -> ResultCode {
        status(self.runtime.block_on(self.vfs.shutdown()))
    }
}

/// An open file behind blocking calls. Taking `&mut self` keeps at most one
/// operation in flight per handle.
pub struct SyncFile {
    file: VfsFile,
    runtime: Arc<Runtime>,
}

impl SyncFile {
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> ResultCode {
        match self.runtime.block_on(self.file.read(buf, offset)) {
            Ok(ReadStatus::Full) => ResultCode::Ok,
            Ok(ReadStatus::Short) => ResultCode::IoErrShortRead,
            Err(e) => fail(e),
        }
    }

    pub fn write(&mut self, data: &[u8], offset: u64) -> ResultCode {
        status(self.runtime.block_on(self.file.write(data, offset)))
    }

    pub fn truncate(&mut self, size: u64) -> ResultCode {
        status(self.runtime.block_on(self.file.truncate(size)))
    }

    pub fn sync(&mut self) -> ResultCode {
        status(self.runtime.block_on(self.file.sync()))
    }

    pub fn file_size(&self) -> u64 {
        self.file.file_size()
    }

    pub fn lock(&mut self, level: i32) -> ResultCode {
        let level = match LockLevel::try_from(level) {
            Ok(level) => level,
            Err(e) => return fail(e),
        };
        status(self.runtime.block_on(self.file.lock(level)))
    }

    pub fn unlock(&mut self, level: i32) -> ResultCode {
        let level = match LockLevel::try_from(level) {
            Ok(level) => level,
            Err(e) => return fail(e),
        };
        status(self.runtime.block_on(self.file.unlock(level)))
    }

    pub fn check_reserved_lock(&self) -> std::result::Result<bool, ResultCode> {
        self.file.check_reserved_lock().map_err(fail)
    }

    pub fn file_control(&mut self, op: i32) -> ResultCode {
        status(
            self.runtime
                .block_on(self.file.file_control(FileControl::from(op))),
        )
    }

    pub fn sector_size(&self) -> u32 {
        crate::vfs::SECTOR_SIZE
    }

    pub fn close(self) -> ResultCode {
        let Self { file, runtime } = self;
        status(runtime.block_on(file.close()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{PurgeConfig, PurgeMode};
    use crate::lock::MemoryLocks;

    const CREATE: i32 = 0x2 | 0x4 | 0x100;

    fn sync_vfs(backend: &MemoryBackend, locks: &Arc<dyn NamedLocks>) -> SyncVfs {
        let config = VfsConfig::default().purge(PurgeConfig::default().mode(PurgeMode::Manual));
        SyncVfs::new(Arc::new(backend.clone()), locks.clone(), config).unwrap()
    }

    #[test]
    fn test_blocking_round_trip() {
        let backend = MemoryBackend::new();
        let locks: Arc<dyn NamedLocks> = Arc::new(MemoryLocks::new());
        let vfs = sync_vfs(&backend, &locks);

        let mut file = vfs.open("db", CREATE).unwrap();
        assert_eq!(file.lock(1), ResultCode::Ok);
        assert_eq!(file.lock(4), ResultCode::Ok);
        assert_eq!(file.file_control(31), ResultCode::Ok);
        assert_eq!(file.write(&[7u8; 1024], 0), ResultCode::Ok);
        assert_eq!(file.write(&[8u8; 1024], 1024), ResultCode::Ok);
        assert_eq!(file.file_control(32), ResultCode::Ok);
        assert_eq!(file.sync(), ResultCode::Ok);
        assert_eq!(file.file_size(), 2048);

        let mut buf = vec![0u8; 2048];
        assert_eq!(file.read(&mut buf, 0), ResultCode::Ok);
        assert!(buf[..1024].iter().all(|b| *b == 7));
        assert!(buf[1024..].iter().all(|b| *b == 8));

        assert_eq!(file.read(&mut buf, 1024), ResultCode::IoErrShortRead);
        assert!(buf[1024..].iter().all(|b| *b == 0));

        assert_eq!(file.unlock(0), ResultCode::Ok);
        assert_eq!(file.close(), ResultCode::Ok);
        assert_eq!(vfs.access("db"), Ok(true));
        assert_eq!(vfs.shutdown(), ResultCode::Ok);
    }

    #[test]
    fn test_error_codes() {
        let backend = MemoryBackend::new();
        let locks: Arc<dyn NamedLocks> = Arc::new(MemoryLocks::new());
        let vfs = sync_vfs(&backend, &locks);

        assert_eq!(vfs.open("missing", 0x2).err(), Some(ResultCode::CantOpen));

        let mut file = vfs.open("db", CREATE).unwrap();
        assert_eq!(file.file_control(99), ResultCode::NotFound);
        assert_eq!(file.lock(7), ResultCode::IoErr);
        assert_eq!(vfs.sector_size(), 512);
        assert_eq!(vfs.device_characteristics(), 0x4000 | 0x200 | 0x400 | 0x800);
        assert_eq!(ResultCode::IoErrShortRead.code(), 522);
    }

    #[test]
    fn test_busy_across_contexts() {
        let backend = MemoryBackend::new();
        let locks: Arc<dyn NamedLocks> = Arc::new(MemoryLocks::new());
        let first = sync_vfs(&backend, &locks);
        let second = sync_vfs(&backend, &locks);

        let mut writer = first.open("db", CREATE).unwrap();
        let mut reader = second.open("db", CREATE).unwrap();

        assert_eq!(writer.lock(4), ResultCode::Ok);
        assert_eq!(reader.lock(1), ResultCode::Busy);
        assert_eq!(reader.check_reserved_lock(), Ok(true));

        assert_eq!(writer.write(b"hello", 0), ResultCode::Ok);
        assert_eq!(writer.sync(), ResultCode::Ok);
        assert_eq!(writer.unlock(0), ResultCode::Ok);

        assert_eq!(reader.lock(1), ResultCode::Ok);
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf, 0), ResultCode::Ok);
        assert_eq!(&buf, b"hello");
    }
}
