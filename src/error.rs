use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    InvalidData(String),
    ChecksumMismatch,
    MutexPoisoned,
    InvalidState(String),
    InvalidOperation(String),
    LockError(io::Error),
    /// The file does not exist and the open flags do not allow creating it.
    CantOpen(String),
    /// A conflicting lock is held elsewhere; the caller should retry later.
    Busy,
    /// The backend transaction expired or already finished.
    TransactionInactive,
    /// A backend transaction was rolled back; reported at the next sync.
    Aborted(String),
    /// The transaction context has shut down.
    Closed,
    UnknownControl(i32),
}

impl Error {
    /// Whether the error describes an undecodable block rather than a failed
    /// backend operation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::InvalidData(_) | Error::ChecksumMismatch | Error::Decode(..)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::CantOpen(path) => write!(f, "Cannot open {}", path),
            Error::Busy => write!(f, "Lock is busy"),
            Error::TransactionInactive => write!(f, "Transaction is no longer active"),
            Error::Aborted(reason) => write!(f, "Transaction aborted: {}", reason),
            Error::Closed => write!(f, "Transaction context is closed"),
            Error::UnknownControl(op) => write!(f, "Unknown file control {}", op),
        }
    }
}

impl std::error::Error for Error {}
