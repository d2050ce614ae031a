//! Append-only journal that makes the in-process store durable.
//!
//! Every committed transaction is written as its list of mutations followed by
//! a commit marker. Replay applies only transactions whose marker made it to
//! disk; a torn or corrupt tail ends the replay.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (32 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+-----------------------------------------------+-----------+
//! |len:u32    | kind:u8 key_len:u32 val_len:u32 key value     |crc32:u32  |
//! +-----------+-----------------------------------------------+-----------+
//! ```
//!
//! - All multi-byte integers are big-endian
//! - The CRC32 covers the payload only
//! - Deletes use `val_len = 0` with no value data

pub mod header;

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use header::{Header, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const KIND_BLOCK: u8 = 1;
const KIND_LEDGER: u8 = 2;
const KIND_COMMIT: u8 = 3;

/// One journaled mutation. A `None` value is a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Block {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    Ledger {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    Commit,
}

impl Record {
    fn encode(&self) -> Result<Vec<u8>> {
        let (kind, key, value): (u8, &[u8], Option<&[u8]>) = match self {
            Record::Block { key, value } => (KIND_BLOCK, key.as_slice(), value.as_deref()),
            Record::Ledger { key, value } => (KIND_LEDGER, key.as_slice(), value.as_deref()),
            Record::Commit => (KIND_COMMIT, &[][..], None),
        };

        let mut payload = Vec::with_capacity(9 + key.len() + value.map_or(0, |v| v.len()));
        payload.push(kind);
        payload.write_u32::<BigEndian>(key.len() as u32)?;
        payload.write_u32::<BigEndian>(value.map_or(0, |v| v.len()) as u32)?;
        payload.extend_from_slice(key);
        if let Some(v) = value {
            payload.extend_from_slice(v);
        }
        Ok(payload)
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let kind = cursor
            .read_u8()
            .map_err(|e| Error::Decode("record kind", e))?;
        let key_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("key length", e))? as usize;
        let value_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("value length", e))? as usize;

        let mut key = vec![0u8; key_len];
        cursor
            .read_exact(&mut key)
            .map_err(|e| Error::Decode("key", e))?;

        let value = if value_len > 0 {
            let mut v = vec![0u8; value_len];
            cursor
                .read_exact(&mut v)
                .map_err(|e| Error::Decode("value", e))?;
            Some(v)
        } else {
            None
        };

        match kind {
            KIND_BLOCK => Ok(Record::Block { key, value }),
            KIND_LEDGER => Ok(Record::Ledger { key, value }),
            KIND_COMMIT => Ok(Record::Commit),
            other => Err(Error::InvalidData(format!("unknown record kind {}", other))),
        }
    }
}

pub struct Journal {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    buffer_size: usize,
    /// File length up to the last commit marker written.
    committed: u64,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Journal {
    /// Opens the journal at `path` for appending, creating it if missing.
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(&Header::new().encode()?)?;
            file.sync_all()?;
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = File::open(path)?;
            reader.read_exact(&mut buf)?;
            Header::decode(&buf)?;
        }

        Ok(Self {
            writer: BufWriter::with_capacity(buffer_size, file.try_clone()?),
            committed: file.metadata()?.len(),
            file,
            path: path.to_path_buf(),
            buffer_size,
        })
    }

    /// Atomically replaces the journal at `path` with one committed
    /// transaction holding `records`, then opens it for appending.
    pub fn rewrite(
        path: &Path,
        records: impl IntoIterator<Item = Record>,
        buffer_size: usize,
    ) -> Result<Self> {
        let tmp = path.with_extension("compact");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::with_capacity(buffer_size, file);
            writer.write_all(&Header::new().encode()?)?;
            for record in records {
                write_record(&mut writer, &record)?;
            }
            write_record(&mut writer, &Record::Commit)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            // make the rename itself durable
            File::open(dir)?.sync_all()?;
        }

        Self::open(path, buffer_size)
    }

    /// Appends a whole transaction and its commit marker in a single write.
    /// A failed append leaves the file as it was after the previous one.
    pub fn append_transaction(&mut self, records: &[Record]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records.iter().chain(std::iter::once(&Record::Commit)) {
            write_record(&mut buf, record)?;
        }

        let written = self
            .writer
            .write_all(&buf)
            .and_then(|()| self.writer.flush());
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "Journal append failed");
            self.discard_tail()?;
            return Err(e.into());
        }
        self.committed += buf.len() as u64;
        Ok(())
    }

    /// Drops buffered bytes and cuts the file back to the last commit.
    fn discard_tail(&mut self) -> Result<()> {
        let fresh = BufWriter::with_capacity(self.buffer_size, self.file.try_clone()?);
        let (_, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        self.file.set_len(self.committed)?;
        Ok(())
    }

    /// Hands buffered records to the operating system.
    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and forces the journal to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Reads the committed transactions of the journal at `path`, oldest
    /// first. Records after the last commit marker are dropped.
    pub fn replay(path: &Path) -> Result<Vec<Vec<Record>>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        Header::decode(&buf)?;

        let mut committed = Vec::new();
        let mut pending = Vec::new();
        loop {
            match read_record(&mut reader) {
                Ok(Some(Record::Commit)) => committed.push(std::mem::take(&mut pending)),
                Ok(Some(record)) => pending.push(record),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Discarding torn journal tail"
                    );
                    break;
                }
            }
        }

        if !pending.is_empty() {
            tracing::debug!(
                path = %path.display(),
                records = pending.len(),
                "Dropping uncommitted journal records"
            );
        }
        Ok(committed)
    }
}

fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<()> {
    let payload = record.encode()?;
    let checksum = CRC32.checksum(&payload);
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.write_u32::<BigEndian>(checksum)?;
    Ok(())
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let record_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; record_len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::InvalidData(format!("Failed to read payload: {}", e)))?;

    let stored_crc = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::InvalidData(format!("Failed to read checksum: {}", e)))?;

    if CRC32.checksum(&payload) != stored_crc {
        return Err(Error::ChecksumMismatch);
    }

    Record::decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn block(key: &[u8], value: Option<&[u8]>) -> Record {
        Record::Block {
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.journal");

        let mut journal = Journal::open(&path, 4096).unwrap();
        journal
            .append_transaction(&[block(b"k1", Some(b"v1")), block(b"k2", None)])
            .unwrap();
        journal
            .append_transaction(&[Record::Ledger {
                key: b"db".to_vec(),
                value: Some(b"ledger".to_vec()),
            }])
            .unwrap();
        journal.sync().unwrap();

        let txns = Journal::replay(&path).unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0], vec![block(b"k1", Some(b"v1")), block(b"k2", None)]);
        assert!(matches!(txns[1][0], Record::Ledger { .. }));
    }

    #[test]
    fn test_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        let txns = Journal::replay(&dir.path().join("absent")).unwrap();
        assert!(txns.is_empty());
    }

    #[test]
    fn test_uncommitted_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.journal");

        let mut journal = Journal::open(&path, 4096).unwrap();
        journal
            .append_transaction(&[block(b"k1", Some(b"v1"))])
            .unwrap();
        write_record(&mut journal.writer, &block(b"k2", Some(b"v2"))).unwrap();
        journal.sync().unwrap();

        let txns = Journal::replay(&path).unwrap();
        assert_eq!(txns, vec![vec![block(b"k1", Some(b"v1"))]]);
    }

    #[test]
    fn test_failed_append_leaves_no_residue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.journal");

        let mut journal = Journal::open(&path, 4096).unwrap();
        journal
            .append_transaction(&[block(b"k1", Some(b"v1"))])
            .unwrap();
        let committed = std::fs::metadata(&path).unwrap().len();

        // a transaction cut short: part reached the file, part is still buffered
        write_record(&mut journal.writer, &block(b"k2", Some(b"v2"))).unwrap();
        journal.writer.flush().unwrap();
        write_record(&mut journal.writer, &block(b"k3", Some(b"v3"))).unwrap();
        journal.discard_tail().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed);

        journal
            .append_transaction(&[block(b"k4", Some(b"v4"))])
            .unwrap();
        journal.sync().unwrap();

        let txns = Journal::replay(&path).unwrap();
        assert_eq!(
            txns,
            vec![
                vec![block(b"k1", Some(b"v1"))],
                vec![block(b"k4", Some(b"v4"))]
            ]
        );
    }

    #[test]
    fn test_corrupt_tail_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.journal");

        let mut journal = Journal::open(&path, 4096).unwrap();
        journal
            .append_transaction(&[block(b"k1", Some(b"v1"))])
            .unwrap();
        journal
            .append_transaction(&[block(b"k2", Some(b"v2"))])
            .unwrap();
        journal.sync().unwrap();
        drop(journal);

        // flip the last byte of the final commit marker's checksum
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let len = file.metadata().unwrap().len();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        file.sync_all().unwrap();

        let txns = Journal::replay(&path).unwrap();
        assert_eq!(txns, vec![vec![block(b"k1", Some(b"v1"))]]);
    }

    #[test]
    fn test_rewrite_compacts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.journal");

        let mut journal = Journal::open(&path, 4096).unwrap();
        for i in 0..10u8 {
            journal
                .append_transaction(&[block(b"k", Some(&[i]))])
                .unwrap();
        }
        journal.sync().unwrap();
        let before = std::fs::metadata(&path).unwrap().len();
        drop(journal);

        let mut journal =
            Journal::rewrite(&path, vec![block(b"k", Some(&[9]))], 4096).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        journal
            .append_transaction(&[block(b"j", Some(b"x"))])
            .unwrap();
        journal.sync().unwrap();

        let txns = Journal::replay(&path).unwrap();
        assert_eq!(
            txns,
            vec![
                vec![block(b"k", Some(&[9]))],
                vec![block(b"j", Some(b"x"))]
            ]
        );
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.journal");
        std::fs::write(&path, vec![0xAB; 64]).unwrap();

        assert!(Journal::open(&path, 4096).is_err());
        assert!(Journal::replay(&path).is_err());
    }
}
