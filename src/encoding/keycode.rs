use super::{EncodingError, Key};
use crate::error::Result;

// Type prefixes for order-preserving encoding
const TYPE_INTEGER: u8 = 0x02;
const TYPE_UNSIGNED: u8 = 0x03;
const TYPE_STRING: u8 = 0x04;

const INTEGER_LEN: usize = 9;

/// Encode a signed integer with order preservation
pub fn encode_integer(i: i64) -> Vec<u8> {
    // Flip the sign bit to ensure negative numbers sort before positive
    let unsigned = (i as u64) ^ (1u64 << 63);
    let mut result = vec![TYPE_INTEGER];
    result.extend_from_slice(&unsigned.to_be_bytes());
    result
}

/// Decode a signed integer from bytes
pub fn decode_integer(bytes: &[u8]) -> Result<i64> {
    let raw = fixed_width(bytes, TYPE_INTEGER, "integer")?;
    Ok((raw ^ (1u64 << 63)) as i64)
}

/// Encode an unsigned integer with order preservation
pub fn encode_unsigned(u: u64) -> Vec<u8> {
    let mut result = vec![TYPE_UNSIGNED];
    result.extend_from_slice(&u.to_be_bytes());
    result
}

/// Decode an unsigned integer from bytes
pub fn decode_unsigned(bytes: &[u8]) -> Result<u64> {
    fixed_width(bytes, TYPE_UNSIGNED, "unsigned")
}

fn fixed_width(bytes: &[u8], prefix: u8, name: &str) -> Result<u64> {
    if bytes.is_empty() {
        return Err(EncodingError::Truncated.into());
    }

    if bytes[0] != prefix {
        return Err(EncodingError::Malformed(format!("Not an {} type", name)).into());
    }

    if bytes.len() != INTEGER_LEN {
        return Err(EncodingError::Malformed(format!(
            "{} must be {} bytes total",
            name, INTEGER_LEN
        ))
        .into());
    }

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[1..INTEGER_LEN]);
    Ok(u64::from_be_bytes(buf))
}

/// Encode a string with order preservation.
///
/// Null bytes are escaped as `00 FF` and the string is terminated by `00 00`,
/// so a string always sorts before any longer string it prefixes and the
/// encoding can be followed by further key components.
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut result = vec![TYPE_STRING];

    for &byte in s.as_bytes() {
        if byte == 0x00 {
            result.extend_from_slice(&[0x00, 0xFF]);
        } else {
            result.push(byte);
        }
    }

    result.extend_from_slice(&[0x00, 0x00]);
    result
}

/// Decode a string from bytes
pub fn decode_string(bytes: &[u8]) -> Result<String> {
    let (s, consumed) = take_string(bytes)?;
    if consumed != bytes.len() {
        return Err(EncodingError::Malformed("Trailing bytes after string".to_string()).into());
    }
    Ok(s)
}

/// Decodes a string at the start of `bytes`, returning it with the number of
/// bytes consumed.
fn take_string(bytes: &[u8]) -> Result<(String, usize)> {
    if bytes.is_empty() {
        return Err(EncodingError::Truncated.into());
    }

    if bytes[0] != TYPE_STRING {
        return Err(EncodingError::Malformed("Not a string type".to_string()).into());
    }

    let mut result = Vec::new();
    let mut i = 1;

    loop {
        match bytes.get(i) {
            None => return Err(EncodingError::Truncated.into()),
            Some(0x00) => match bytes.get(i + 1) {
                Some(0xFF) => {
                    result.push(0x00);
                    i += 2;
                }
                Some(0x00) => {
                    i += 2;
                    break;
                }
                Some(_) => {
                    return Err(
                        EncodingError::Malformed("Invalid null byte escape".to_string()).into(),
                    )
                }
                None => return Err(EncodingError::Truncated.into()),
            },
            Some(&byte) => {
                result.push(byte);
                i += 1;
            }
        }
    }

    let s = String::from_utf8(result).map_err(|_| EncodingError::NotUtf8)?;
    Ok((s, i))
}

/// Reads the components of a composite key in order.
pub struct KeyReader<'a> {
    bytes: &'a [u8],
}

impl<'a> KeyReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let (s, consumed) = take_string(self.bytes)?;
        self.bytes = &self.bytes[consumed..];
        Ok(s)
    }

    pub fn read_integer(&mut self) -> Result<i64> {
        let value = decode_integer(self.take(INTEGER_LEN)?)?;
        Ok(value)
    }

    pub fn read_unsigned(&mut self) -> Result<u64> {
        let value = decode_unsigned(self.take(INTEGER_LEN)?)?;
        Ok(value)
    }

    /// Fails unless every byte of the key has been consumed.
    pub fn finish(self) -> Result<()> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(EncodingError::Malformed(format!(
                "{} trailing bytes in key",
                self.bytes.len()
            ))
            .into())
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(EncodingError::Truncated.into());
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }
}

impl Key for i64 {
    fn encode(&self) -> Vec<u8> {
        encode_integer(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_integer(bytes)
    }
}

impl Key for u64 {
    fn encode(&self) -> Vec<u8> {
        encode_unsigned(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_unsigned(bytes)
    }
}

impl Key for String {
    fn encode(&self) -> Vec<u8> {
        encode_string(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_string(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_ordering() {
        let values = [i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        let encoded: Vec<_> = values.iter().map(|v| v.encode()).collect();

        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i]);
        }

        for (original, encoded) in values.iter().zip(encoded.iter()) {
            assert_eq!(&i64::decode(encoded).unwrap(), original);
        }
    }

    #[test]
    fn test_unsigned_ordering() {
        let values = [0u64, 1, 512, 4096, 1 << 40, u64::MAX];
        let encoded: Vec<_> = values.iter().map(|v| v.encode()).collect();

        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i]);
        }
        assert_eq!(u64::decode(&encoded[3]).unwrap(), 4096);
    }

    #[test]
    fn test_string_prefix_sorts_first() {
        let short = "main.db".to_string().encode();
        let long = "main.db-journal".to_string().encode();
        assert!(short < long);

        // a prefix followed by another component still sorts before the longer string
        let mut composite = short.clone();
        composite.extend(encode_unsigned(u64::MAX));
        assert!(composite < long);
    }

    #[test]
    fn test_string_with_null_bytes() {
        let original = "a\0b".to_string();
        let encoded = original.encode();
        assert_eq!(String::decode(&encoded).unwrap(), original);
        assert!("a".to_string().encode() < encoded);
    }

    #[test]
    fn test_truncated_string() {
        let mut encoded = "abc".to_string().encode();
        encoded.pop();
        assert!(matches!(
            String::decode(&encoded),
            Err(crate::Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_key_reader_composite() {
        let mut bytes = encode_string("db");
        bytes.extend(encode_unsigned(8192));
        bytes.extend(encode_integer(-3));

        let mut reader = KeyReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "db");
        assert_eq!(reader.read_unsigned().unwrap(), 8192);
        assert_eq!(reader.read_integer().unwrap(), -3);
        reader.finish().unwrap();
    }

    #[test]
    fn test_key_reader_rejects_trailing_bytes() {
        let mut bytes = encode_unsigned(1);
        bytes.push(0x01);

        let mut reader = KeyReader::new(&bytes);
        reader.read_unsigned().unwrap();
        assert!(reader.finish().is_err());
    }
}
