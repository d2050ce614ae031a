pub mod bincode;
pub mod keycode;

use crate::error::Result;

/// A key whose encoded bytes sort in the same order as the key itself, so a
/// byte range over the store covers a contiguous run of keys.
pub trait Key {
    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// A stored value. Its bytes carry no ordering.
pub trait Value {
    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Why stored bytes could not be turned back into a key or value.
#[derive(Debug)]
pub enum EncodingError {
    /// Bytes present but not in the expected layout.
    Malformed(String),
    /// Input ended in the middle of a field.
    Truncated,
    /// A string field held bytes that are not UTF-8.
    NotUtf8,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::Malformed(msg) => write!(f, "malformed encoding: {}", msg),
            EncodingError::Truncated => write!(f, "encoded field cut short"),
            EncodingError::NotUtf8 => write!(f, "string field is not UTF-8"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::InvalidData(err.to_string())
    }
}
