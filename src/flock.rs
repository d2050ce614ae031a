use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::lock::LockMode;

/// An advisory `flock` held for as long as the value lives.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Creates the file if needed and locks it exclusively, failing at once
    /// if it is held elsewhere. The lock file contains the process ID for
    /// debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::flock(&file, LockMode::Exclusive)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self {
            _file: file,
            path,
            mode: LockMode::Exclusive,
        })
    }

    /// Attempts to take a lock in `mode` without waiting. Returns `None` when
    /// a conflicting lock is held, by this process or another one.
    pub fn try_lock<P: AsRef<Path>>(path: P, mode: LockMode) -> io::Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match Self::flock(&file, mode) {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path,
                mode,
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(unix)]
    fn flock(file: &File, mode: LockMode) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB, LOCK_SH};

        let operation = match mode {
            LockMode::Shared => LOCK_SH,
            LockMode::Exclusive => LOCK_EX,
        };
        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, operation | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn flock(_file: &File, _mode: LockMode) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locks require flock",
        ))
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}
