//! On-disk record framing and integrity checking.
//!
//! # File Format
//!
//! Each segment data file starts with a framed header and is followed by
//! framed entry records:
//!
//! ```text
//! +----------------------------+
//! | Metadata | LogHeader       |   <- no delimiter, written once
//! +----------------------------+
//! | 0x4C45 | Metadata | entry  |
//! +----------------------------+
//! | 0x4C45 | Metadata | entry  |
//! +----------------------------+
//! | ...                        |
//! +----------------------------+
//! ```
//!
//! ## Metadata envelope
//!
//! Every framed object is preceded by a fixed-size envelope:
//!
//! ```text
//! +------------+-----------+
//! |checksum:i32| length:i32|
//! +------------+-----------+
//! |  4 bytes   |  4 bytes  |
//! +------------+-----------+
//! ```
//!
//! - All multi-byte integers use big-endian encoding for portability
//! - The checksum is CRC-32C of the serialized object behind the envelope
//! - The delimiter lets recovery tell a torn tail (zeros from a crashed
//!   append) from corruption mid-record
//!
//! Trim sidecar files hold length-delimited [`TrimEntry`] records instead:
//! `[length:u32][checksum:i32][address:i64]`, where the checksum is CRC-32C
//! of the address's 8 big-endian bytes.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::entry::LogEntry;
use crate::error::{Error, Result};

/// Marks the start of every entry record.
pub const RECORD_DELIMITER: u16 = 0x4C45;

/// Format version written into every segment header.
pub const VERSION: u32 = 1;

/// Serialized size of the metadata envelope.
pub const METADATA_SIZE: usize = 8;

/// Serialized size of the header body behind its envelope.
pub const HEADER_SIZE: usize = 5;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C of a serialized payload, as the signed value stored on disk.
pub fn checksum(bytes: &[u8]) -> i32 {
    CRC32.checksum(bytes) as i32
}

/// CRC-32C of an address, computed over its 8 big-endian bytes.
pub fn address_checksum(address: u64) -> i32 {
    CRC32.checksum(&address.to_be_bytes()) as i32
}

/// Fixed-size envelope in front of every framed object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metadata {
    pub checksum: i32,
    pub length: i32,
}

impl Metadata {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: checksum(payload),
            length: payload.len() as i32,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(METADATA_SIZE);
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < METADATA_SIZE {
            return Err(Error::Corruption("short metadata envelope".to_string()));
        }
        let mut reader = bytes;
        let checksum = reader.read_i32::<BigEndian>()?;
        let length = reader.read_i32::<BigEndian>()?;
        if length < 0 {
            return Err(Error::Corruption(format!("negative record length {length}")));
        }
        Ok(Self { checksum, length })
    }
}

/// One per data file, written exactly once at segment creation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogHeader {
    pub version: u32,
    /// Whether entries in this file carry verifiable checksums.
    pub verify_checksum: bool,
}

impl LogHeader {
    pub fn new(verify_checksum: bool) -> Self {
        Self {
            version: VERSION,
            verify_checksum,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.verify_checksum as u8);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corruption("short log header".to_string()));
        }
        let mut reader = bytes;
        let version = reader.read_u32::<BigEndian>()?;
        let verify_checksum = reader.read_u8()? != 0;
        Ok(Self {
            version,
            verify_checksum,
        })
    }
}

/// Frames a segment header: `[Metadata][LogHeader]`, no delimiter.
pub fn encode_header(header: &LogHeader) -> Vec<u8> {
    let body = header.encode();
    let mut framed = Metadata::for_payload(&body).encode();
    framed.extend_from_slice(&body);
    framed
}

/// Reads the framed header at the current position of `reader`.
///
/// The header checksum is always verified, regardless of the store's
/// verification mode.
pub fn decode_header<R: Read>(reader: &mut R) -> Result<LogHeader> {
    let mut envelope = [0u8; METADATA_SIZE];
    reader
        .read_exact(&mut envelope)
        .map_err(|e| Error::Corruption(format!("short header envelope: {e}")))?;
    let metadata = Metadata::decode(&envelope)?;

    let mut body = vec![0u8; metadata.length as usize];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Corruption(format!("short header record: {e}")))?;

    if metadata.checksum != checksum(&body) {
        return Err(Error::Corruption("header checksum mismatch".to_string()));
    }

    LogHeader::decode(&body)
}

/// Frames an entry record: `[delimiter][Metadata][entry bytes]`.
///
/// Returns the envelope alongside the framed bytes so callers can index the
/// record without re-hashing it.
pub fn frame_record(entry: &LogEntry) -> Result<(Metadata, Vec<u8>)> {
    let body = bincode::serialize(entry)?;
    let metadata = Metadata::for_payload(&body);

    let mut framed = Vec::with_capacity(2 + METADATA_SIZE + body.len());
    framed.extend_from_slice(&RECORD_DELIMITER.to_be_bytes());
    framed.extend_from_slice(&metadata.encode());
    framed.extend_from_slice(&body);
    Ok((metadata, framed))
}

/// Decodes an entry body, verifying it against its envelope when `verify`
/// is set. The checksum field is always present on disk; `verify` only
/// controls whether a mismatch is fatal.
pub fn decode_entry(metadata: &Metadata, body: &[u8], verify: bool) -> Result<LogEntry> {
    if verify && metadata.checksum != checksum(body) {
        return Err(Error::Corruption(format!(
            "entry checksum mismatch: stored {}, computed {}",
            metadata.checksum,
            checksum(body)
        )));
    }
    Ok(bincode::deserialize(body)?)
}

/// A recorded trim, one per line of the `.trimmed` / `.pending` sidecars.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrimEntry {
    pub checksum: i32,
    pub address: i64,
}

impl TrimEntry {
    pub fn for_address(address: u64) -> Self {
        Self {
            checksum: address_checksum(address),
            address: address as i64,
        }
    }

    pub fn address(&self) -> u64 {
        self.address as u64
    }

    /// Length-delimited encoding: `[length:u32][checksum:i32][address:i64]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 12);
        buf.extend_from_slice(&12u32.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.address.to_be_bytes());
        buf
    }

    /// Reads the next trim entry from a sidecar stream. Returns `None` at a
    /// clean end of stream, or on a torn trailing entry left by a crash.
    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let length = match reader.read_u32::<BigEndian>() {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; length];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if payload.len() < 12 {
            return Err(Error::Corruption(format!(
                "trim entry too short: {length} bytes"
            )));
        }

        let mut reader = payload.as_slice();
        let checksum = reader.read_i32::<BigEndian>()?;
        let address = reader.read_i64::<BigEndian>()?;
        Ok(Some(Self { checksum, address }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::entry::{DataType, LogData};

    fn sample_entry() -> LogEntry {
        LogEntry::from_data(7, &LogData::new(DataType::Data, b"hello log".to_vec()))
    }

    #[test]
    fn test_crc32c_known_vector() {
        // CRC-32C ("123456789") from the Castagnoli reference tables.
        assert_eq!(CRC32.checksum(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let metadata = Metadata {
            checksum: -17,
            length: 42,
        };
        let encoded = metadata.encode();

        assert_eq!(encoded.len(), METADATA_SIZE);
        assert_eq!(Metadata::decode(&encoded).unwrap(), metadata);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = LogHeader::new(true);
        let framed = encode_header(&header);

        assert_eq!(framed.len(), METADATA_SIZE + HEADER_SIZE);

        let decoded = decode_header(&mut Cursor::new(&framed)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_checksum_mismatch() {
        let mut framed = encode_header(&LogHeader::new(true));
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;

        match decode_header(&mut Cursor::new(&framed)) {
            Err(Error::Corruption(_)) => {}
            other => panic!("Expected corruption error, got {:?}", other),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let entry = sample_entry();
        let (metadata, framed) = frame_record(&entry).unwrap();

        // Delimiter, envelope, then exactly `length` body bytes.
        assert_eq!(&framed[..2], &RECORD_DELIMITER.to_be_bytes());
        assert_eq!(framed.len(), 2 + METADATA_SIZE + metadata.length as usize);

        let body = &framed[2 + METADATA_SIZE..];
        let decoded = decode_entry(&metadata, body, true).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let (metadata, framed) = frame_record(&sample_entry()).unwrap();
        let mut body = framed[2 + METADATA_SIZE..].to_vec();
        body[0] ^= 0x01;

        assert!(matches!(
            decode_entry(&metadata, &body, true),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_verification_can_be_disabled() {
        let entry = sample_entry();
        let (metadata, framed) = frame_record(&entry).unwrap();
        let metadata = Metadata {
            checksum: metadata.checksum ^ 1,
            length: metadata.length,
        };
        let body = &framed[2 + METADATA_SIZE..];

        assert!(decode_entry(&metadata, body, true).is_err());
        assert_eq!(decode_entry(&metadata, body, false).unwrap(), entry);
    }

    #[test]
    fn test_trim_entry_roundtrip() {
        let entry = TrimEntry::for_address(12345);
        let encoded = entry.encode();

        let decoded = TrimEntry::decode_from(&mut Cursor::new(&encoded))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.address(), 12345);
        assert_eq!(decoded.checksum, address_checksum(12345));
    }

    #[test]
    fn test_torn_trim_entry_is_skipped() {
        let encoded = TrimEntry::for_address(5).encode();

        // A crash can leave a partial record at the tail of the sidecar.
        let torn = &encoded[..encoded.len() - 3];
        assert_eq!(TrimEntry::decode_from(&mut Cursor::new(torn)).unwrap(), None);

        // Empty stream ends cleanly too.
        let empty: &[u8] = &[];
        assert_eq!(
            TrimEntry::decode_from(&mut Cursor::new(empty)).unwrap(),
            None
        );
    }
}
