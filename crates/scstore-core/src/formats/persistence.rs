//! # Persistence Format
//!
//! Binary serialization of segments and of the memory content store.
//!
//! Format: Header (5 bytes) + postcard-serialized payload.
//! - 4 bytes: Magic (`"SCSG"` for segments, `"SCCT"` for content snapshots)
//! - 1 byte: Version
//!
//! Segment contents travel as opaque byte blocks; each block is stored with
//! its BLAKE3 checksum and verified on load.
//!
//! ## Validation
//!
//! - Maximum payload size (`MAX_PERSISTENCE_PAYLOAD_SIZE`) checked first
//! - Header validated before payload parsing
//! - Corrupted data surfaces as `ScError::Io`, never as a panic

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::primitives::{self, CHECKSUM_LEN};
use crate::segment::ElementRecord;
use crate::types::{Checksum, ScError};

/// Maximum allowed payload size for a persisted file (1 GiB).
///
/// Validated before any deserialization is attempted.
pub const MAX_PERSISTENCE_PAYLOAD_SIZE: usize = 1024 * 1024 * 1024;

const HEADER_LEN: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The header preceding every persisted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    #[must_use]
    pub fn new(magic: &[u8; 4]) -> Self {
        Self {
            magic: *magic,
            version: primitives::FORMAT_VERSION,
        }
    }

    /// Check magic and version against what the reader expects.
    pub fn validate(&self, magic: &[u8; 4]) -> Result<(), ScError> {
        if &self.magic != magic {
            return Err(ScError::Io("invalid magic bytes".to_string()));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(ScError::Io(format!(
                "unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScError> {
        if bytes.len() < HEADER_LEN {
            return Err(ScError::Io("header too short".to_string()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

// =============================================================================
// SEGMENT BLOCKS
// =============================================================================

/// One segment's encoded contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBlock {
    pub num: u16,
    pub bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredBlock {
    num: u16,
    checksum: [u8; CHECKSUM_LEN],
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SegmentsFile {
    blocks: Vec<StoredBlock>,
}

pub(crate) fn encode_records(records: &[ElementRecord]) -> Result<Vec<u8>, ScError> {
    postcard::to_stdvec(records).map_err(|e| ScError::Io(e.to_string()))
}

pub(crate) fn decode_records(bytes: &[u8]) -> Result<Vec<ElementRecord>, ScError> {
    postcard::from_bytes(bytes)
        .map_err(|e| ScError::Io(format!("failed to decode segment records: {}", e)))
}

fn with_header(magic: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(HEADER_LEN + payload.len());
    result.extend_from_slice(&PersistenceHeader::new(magic).to_bytes());
    result.extend_from_slice(payload);
    result
}

fn checked_payload<'a>(magic: &[u8; 4], bytes: &'a [u8]) -> Result<&'a [u8], ScError> {
    if bytes.len() < HEADER_LEN {
        return Err(ScError::Io(
            "data too short: minimum 5 bytes required".to_string(),
        ));
    }
    if bytes.len() > MAX_PERSISTENCE_PAYLOAD_SIZE {
        return Err(ScError::Io(format!(
            "data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_PERSISTENCE_PAYLOAD_SIZE
        )));
    }
    PersistenceHeader::from_bytes(bytes)?.validate(magic)?;
    Ok(&bytes[HEADER_LEN..])
}

/// Serialize segment blocks (header + payload).
pub fn segments_to_bytes(blocks: &[SegmentBlock]) -> Result<Vec<u8>, ScError> {
    let file = SegmentsFile {
        blocks: blocks
            .iter()
            .map(|block| StoredBlock {
                num: block.num,
                checksum: Checksum::of(&block.bytes).0,
                bytes: block.bytes.clone(),
            })
            .collect(),
    };
    let payload = postcard::to_stdvec(&file).map_err(|e| ScError::Io(e.to_string()))?;
    Ok(with_header(primitives::MAGIC_BYTES, &payload))
}

/// Deserialize segment blocks, verifying every block checksum.
pub fn segments_from_bytes(bytes: &[u8]) -> Result<Vec<SegmentBlock>, ScError> {
    let payload = checked_payload(primitives::MAGIC_BYTES, bytes)?;
    let file: SegmentsFile = postcard::from_bytes(payload)
        .map_err(|e| ScError::Io(format!("failed to decode segments file: {}", e)))?;

    file.blocks
        .into_iter()
        .map(|block| {
            if Checksum::of(&block.bytes).0 != block.checksum {
                return Err(ScError::Io(format!(
                    "checksum mismatch in segment {}",
                    block.num
                )));
            }
            Ok(SegmentBlock {
                num: block.num,
                bytes: block.bytes,
            })
        })
        .collect()
}

/// Write segment blocks to `path`, replacing the file atomically.
pub fn save(path: &Path, blocks: &[SegmentBlock]) -> Result<(), ScError> {
    write_atomic(path, &segments_to_bytes(blocks)?)
}

/// Read segment blocks from `path`. A missing file is an empty repository.
pub fn load(path: &Path) -> Result<Vec<SegmentBlock>, ScError> {
    match fs::read(path) {
        Ok(bytes) => segments_from_bytes(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ScError::Io(e.to_string())),
    }
}

// =============================================================================
// CONTENT SNAPSHOTS
// =============================================================================

/// One content entry of the memory content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub checksum: [u8; CHECKSUM_LEN],
    /// Stored bytes; `None` for content kept inline by its links.
    pub content: Option<Vec<u8>>,
    /// Packed addresses (`Addr::to_u32`) of links referencing the checksum.
    pub backrefs: Vec<u32>,
}

pub fn content_to_bytes(entries: &[ContentEntry]) -> Result<Vec<u8>, ScError> {
    let payload = postcard::to_stdvec(entries).map_err(|e| ScError::Io(e.to_string()))?;
    Ok(with_header(primitives::CONTENT_MAGIC_BYTES, &payload))
}

pub fn content_from_bytes(bytes: &[u8]) -> Result<Vec<ContentEntry>, ScError> {
    let payload = checked_payload(primitives::CONTENT_MAGIC_BYTES, bytes)?;
    postcard::from_bytes(payload)
        .map_err(|e| ScError::Io(format!("failed to decode content snapshot: {}", e)))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ScError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|e| ScError::Io(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| ScError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| ScError::Io(e.to_string()))?;
    }
    fs::rename(&tmp, path).map_err(|e| ScError::Io(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block(num: u16, bytes: &[u8]) -> SegmentBlock {
        SegmentBlock {
            num,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = PersistenceHeader::new(primitives::MAGIC_BYTES);
        let restored = PersistenceHeader::from_bytes(&header.to_bytes()).expect("parse header");
        assert_eq!(restored, header);
        restored
            .validate(primitives::MAGIC_BYTES)
            .expect("valid header");
        assert!(restored.validate(primitives::CONTENT_MAGIC_BYTES).is_err());
    }

    #[test]
    fn segments_bytes_are_stable() {
        let blocks = vec![block(0, b"first"), block(3, b"third")];
        let bytes1 = segments_to_bytes(&blocks).expect("serialize");
        let restored = segments_from_bytes(&bytes1).expect("deserialize");
        assert_eq!(restored, blocks);
        let bytes2 = segments_to_bytes(&restored).expect("reserialize");
        assert_eq!(bytes1, bytes2, "save -> load -> save must be bit-exact");
    }

    #[test]
    fn corrupted_block_is_rejected() {
        let mut bytes = segments_to_bytes(&[block(1, b"payload bytes")]).expect("serialize");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = segments_from_bytes(&bytes).expect_err("corruption must be detected");
        assert!(matches!(err, ScError::Io(_)));
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut bytes = vec![0u8; 10];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(segments_from_bytes(&bytes).is_err());
        assert!(content_from_bytes(&bytes).is_err());
        assert!(segments_from_bytes(&[1, 2]).is_err());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().expect("temp dir");
        let loaded = load(&dir.path().join("absent.scg")).expect("load");
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_then_load_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join(primitives::SEGMENTS_FILE_NAME);
        let blocks = vec![block(0, &[1, 2, 3])];
        save(&path, &blocks).expect("save");
        assert_eq!(load(&path).expect("load"), blocks);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn content_snapshot_roundtrip() {
        let entries = vec![ContentEntry {
            checksum: [7; CHECKSUM_LEN],
            content: Some(vec![9; 40]),
            backrefs: vec![1, 65_537],
        }];
        let bytes = content_to_bytes(&entries).expect("serialize");
        assert_eq!(content_from_bytes(&bytes).expect("deserialize"), entries);
    }
}
