//! Append-only document log.
//!
//! Documents are appended to a single file and addressed by the byte offset
//! of their record. The trie stores those offsets as its values and reads the
//! key back through the log when it needs to compare full keys.
//!
//! # Record Format
//!
//! ```text
//! +----------+--------------------------------------+
//! | 0-1      | key_len (2 bytes)                    |
//! | 2-3      | reserved (2 bytes)                   |
//! | 4-7      | meta_len (4 bytes)                   |
//! | 8-11     | body_len (4 bytes)                   |
//! | 12-N     | key, meta, body                      |
//! | N-N+3    | CRC32 checksum (4 bytes)             |
//! +----------+--------------------------------------+
//! ```
//!
//! Opening a log scans every record and cuts off a torn or corrupt tail, so
//! a crash in the middle of an append loses only that append.

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Record header size (before key, meta and body).
const RECORD_HEADER_SIZE: usize = 12;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// A document stored in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
}

impl Document {
    /// Create a document from its parts.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>, meta: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            meta: meta.into(),
            body: body.into(),
        }
    }

    /// Total serialized size of this document's record.
    #[must_use]
    pub fn record_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + self.meta.len() + self.body.len() + CHECKSUM_SIZE
    }

    fn to_bytes(&self) -> Result<Vec<u8>, DocLogError> {
        let key_len =
            u16::try_from(self.key.len()).map_err(|_| DocLogError::KeyTooLong(self.key.len()))?;
        let meta_len = u32::try_from(self.meta.len())
            .map_err(|_| DocLogError::RecordTooLarge(self.meta.len()))?;
        let body_len = u32::try_from(self.body.len())
            .map_err(|_| DocLogError::RecordTooLarge(self.body.len()))?;

        let mut bytes = Vec::with_capacity(self.record_size());
        bytes.extend_from_slice(&key_len.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&meta_len.to_le_bytes());
        bytes.extend_from_slice(&body_len.to_le_bytes());
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.meta);
        bytes.extend_from_slice(&self.body);

        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        Ok(bytes)
    }
}

/// Lengths decoded from a record header.
struct RecordHeader {
    key_len: usize,
    meta_len: usize,
    body_len: usize,
}

impl RecordHeader {
    fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            key_len: u16::from_le_bytes([bytes[0], bytes[1]]) as usize,
            meta_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize,
            body_len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
        }
    }

    const fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key_len + self.meta_len + self.body_len + CHECKSUM_SIZE
    }
}

struct LogFile {
    file: File,
    /// Offset one past the last complete record.
    tail: u64,
}

impl LogFile {
    /// Read and verify the record at `offset`.
    fn read_record(&mut self, offset: u64) -> Result<Document, DocLogError> {
        if offset + RECORD_HEADER_SIZE as u64 > self.tail {
            return Err(DocLogError::InvalidOffset(offset));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact(&mut header_buf)?;
        let header = RecordHeader::from_bytes(&header_buf);

        let record_len = header.record_len();
        if offset + record_len as u64 > self.tail {
            return Err(DocLogError::CorruptRecord { offset });
        }

        let mut record = vec![0u8; record_len];
        record[..RECORD_HEADER_SIZE].copy_from_slice(&header_buf);
        self.file.read_exact(&mut record[RECORD_HEADER_SIZE..])?;

        let checksum_at = record_len - CHECKSUM_SIZE;
        let stored = u32::from_le_bytes([
            record[checksum_at],
            record[checksum_at + 1],
            record[checksum_at + 2],
            record[checksum_at + 3],
        ]);
        let computed = crc32fast::hash(&record[..checksum_at]);
        if stored != computed {
            return Err(DocLogError::ChecksumMismatch {
                offset,
                expected: stored,
                actual: computed,
            });
        }

        let key_end = RECORD_HEADER_SIZE + header.key_len;
        let meta_end = key_end + header.meta_len;
        Ok(Document {
            key: record[RECORD_HEADER_SIZE..key_end].to_vec(),
            meta: record[key_end..meta_end].to_vec(),
            body: record[meta_end..checksum_at].to_vec(),
        })
    }
}

/// An append-only log of documents addressed by byte offset.
///
/// All methods take `&self`; the file handle sits behind a mutex so the log
/// can be appended to while a trie holds a shared reference to it as its
/// key resolver.
pub struct DocLog {
    inner: Mutex<LogFile>,
}

impl DocLog {
    /// Open the log at `path`, creating it if missing.
    ///
    /// A torn or corrupt tail is truncated away.
    pub fn open(path: &Path) -> Result<Self, DocLogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut log = LogFile { file, tail: file_len };
        let mut offset = 0;
        let mut records = 0u64;
        while offset < file_len {
            match log.read_record(offset) {
                Ok(document) => {
                    offset += document.record_size() as u64;
                    records += 1;
                }
                Err(DocLogError::Io(e)) if e.kind() != std::io::ErrorKind::UnexpectedEof => {
                    return Err(DocLogError::Io(e));
                }
                Err(e) => {
                    tracing::warn!(
                        "document log {}: dropping {} bytes after offset {offset}: {e}",
                        path.display(),
                        file_len - offset
                    );
                    log.file.set_len(offset)?;
                    log.file.sync_all()?;
                    break;
                }
            }
        }
        log.tail = offset;

        tracing::debug!(
            "opened document log {} with {records} records ({offset} bytes)",
            path.display()
        );
        Ok(Self {
            inner: Mutex::new(log),
        })
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, LogFile> {
        self.inner.lock().expect("document log lock poisoned")
    }

    /// Append a document, returning the offset of its record.
    pub fn append(&self, document: &Document) -> Result<u64, DocLogError> {
        let bytes = document.to_bytes()?;
        let mut log = self.lock();

        let offset = log.tail;
        log.file.seek(SeekFrom::Start(offset))?;
        log.file.write_all(&bytes)?;
        log.tail += bytes.len() as u64;
        Ok(offset)
    }

    /// Read the document at `offset`.
    pub fn read(&self, offset: u64) -> Result<Document, DocLogError> {
        self.lock().read_record(offset)
    }

    /// Read only the key of the document at `offset`.
    pub fn read_key(&self, offset: u64) -> Result<Vec<u8>, DocLogError> {
        self.read(offset).map(|document| document.key)
    }

    /// Make every appended document durable.
    pub fn sync(&self) -> Result<(), DocLogError> {
        Ok(self.lock().file.sync_data()?)
    }

    /// Size of the log in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.lock().tail
    }

    /// Whether the log holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors that can occur in the document log.
#[derive(Debug)]
pub enum DocLogError {
    /// I/O error.
    Io(std::io::Error),
    /// No record starts at this offset.
    InvalidOffset(u64),
    /// Record runs past the end of the log.
    CorruptRecord { offset: u64 },
    /// Checksum mismatch.
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },
    /// Key longer than a record can hold.
    KeyTooLong(usize),
    /// Meta or body longer than a record can hold.
    RecordTooLarge(usize),
}

impl std::fmt::Display for DocLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "document log I/O error: {e}"),
            Self::InvalidOffset(o) => write!(f, "no document at offset {o}"),
            Self::CorruptRecord { offset } => write!(f, "corrupt document record at {offset}"),
            Self::ChecksumMismatch {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "document checksum mismatch at {offset}: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
            Self::KeyTooLong(len) => write!(f, "document key too long: {len} bytes"),
            Self::RecordTooLarge(len) => write!(f, "document part too large: {len} bytes"),
        }
    }
}

impl std::error::Error for DocLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DocLogError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().expect("create temp dir");
        let log = DocLog::open(&dir.path().join("docs.log")).expect("open log");
        assert!(log.is_empty());

        let first = Document::new("aaaa", "meta-a", "body-a");
        let second = Document::new("bbbb", Vec::new(), vec![7u8; 300]);
        let a = log.append(&first).expect("append a");
        let b = log.append(&second).expect("append b");

        assert_eq!(a, 0);
        assert_eq!(b, first.record_size() as u64);
        assert_eq!(log.read(a).expect("read a"), first);
        assert_eq!(log.read(b).expect("read b"), second);
        assert_eq!(log.read_key(b).expect("read key"), b"bbbb");
    }

    #[test]
    fn test_reopen_keeps_documents() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("docs.log");

        let offset = {
            let log = DocLog::open(&path).expect("open log");
            let offset = log.append(&Document::new("key", "m", "b")).expect("append");
            log.sync().expect("sync");
            offset
        };

        let log = DocLog::open(&path).expect("reopen log");
        assert_eq!(log.read_key(offset).expect("read key"), b"key");
        let next = log.append(&Document::new("key2", "", "")).expect("append");
        assert!(next > offset);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("docs.log");

        let intact_len = {
            let log = DocLog::open(&path).expect("open log");
            log.append(&Document::new("one", "", "1")).expect("append");
            log.append(&Document::new("two", "", "2")).expect("append");
            log.sync().expect("sync");
            log.len()
        };

        // Half of a third record
        let partial = Document::new("three", "", "3").to_bytes().expect("encode");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(&partial[..partial.len() / 2]).expect("write partial");
        drop(file);

        let log = DocLog::open(&path).expect("reopen log");
        assert_eq!(log.len(), intact_len);
        let offset = log.append(&Document::new("three", "", "3")).expect("append");
        assert_eq!(offset, intact_len);
        assert_eq!(log.read_key(offset).expect("read key"), b"three");
    }

    #[test]
    fn test_corruption_detected_on_read() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("docs.log");
        let log = DocLog::open(&path).expect("open log");
        let offset = log.append(&Document::new("key", "", "body")).expect("append");
        log.sync().expect("sync");

        let mut file = OpenOptions::new().write(true).open(&path).expect("open raw");
        file.seek(SeekFrom::Start(offset + RECORD_HEADER_SIZE as u64))
            .expect("seek");
        file.write_all(b"X").expect("flip byte");
        file.sync_all().expect("sync raw");

        assert!(matches!(
            log.read(offset),
            Err(DocLogError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_offset() {
        let dir = tempdir().expect("create temp dir");
        let log = DocLog::open(&dir.path().join("docs.log")).expect("open log");
        log.append(&Document::new("k", "", "")).expect("append");

        assert!(matches!(log.read(1000), Err(DocLogError::InvalidOffset(1000))));
    }
}
