use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const HEADER_SIZE: usize = 32;

const MAGIC: &[u8; 8] = b"BLKVFS\x00J";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
}

impl Header {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidData("bad journal magic".to_string()));
        }
        if self.version != VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported journal version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        (&mut buf[8..12])
            .write_u32::<BigEndian>(self.version)
            .map_err(|e| Error::Encode("version", e))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let version = (&bytes[8..12])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("version", e))?;

        let header = Self { magic, version };
        header.validate()?;
        Ok(header)
    }
}
