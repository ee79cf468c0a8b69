//! Redo log record payloads and the on-disk block framing

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{Lsn, LsnRange};

/// A pre-serialized redo record.
///
/// The bytes come from the record codec and are never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    payload: Bytes,
}

impl LogRecord {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

impl From<Vec<u8>> for LogRecord {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&'static [u8]> for LogRecord {
    fn from(payload: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(payload))
    }
}

/// A contiguous run of redo bytes as the writer persists it.
///
/// Each block is stored as:
/// - 4-byte little-endian length prefix
/// - bincode-encoded `RedoBlock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoBlock {
    /// LSN of the first byte in `data`
    pub start_lsn: Lsn,
    /// CRC32 of `data`
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl RedoBlock {
    pub fn new(start_lsn: Lsn, data: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&data);
        Self {
            start_lsn,
            checksum,
            data,
        }
    }

    pub fn range(&self) -> LsnRange {
        LsnRange::new(self.start_lsn, self.start_lsn + self.data.len() as u64)
    }

    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_record_creation() {
        let record = LogRecord::new(vec![1u8, 2, 3]);
        assert_eq!(record.len(), 3);
        assert!(!record.is_empty());
        assert_eq!(record.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_log_record_from_static() {
        let record: LogRecord = (&b"page init"[..]).into();
        assert_eq!(record.len(), 9);
        assert_eq!(record.into_bytes(), Bytes::from_static(b"page init"));
    }

    #[test]
    fn test_redo_block_checksum() {
        let mut block = RedoBlock::new(100, b"redo bytes".to_vec());
        assert!(block.verify());
        assert_eq!(block.range(), LsnRange::new(100, 110));

        block.data[0] ^= 0xff;
        assert!(!block.verify());
    }

    #[test]
    fn test_redo_block_serialization() {
        let block = RedoBlock::new(42, vec![7u8; 16]);
        let encoded = bincode::serialize(&block).unwrap();
        let decoded: RedoBlock = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.verify());
    }
}
