//! Log addresses and record payloads.
//!
//! [`LogData`] is the record as callers see it: stream ids are [`Uuid`]s and
//! addresses are unsigned. [`LogEntry`] is its on-disk shape, where stream
//! ids travel in UUID text form so the record schema stays language-neutral.
//! Conversion happens at the codec boundary, never in the hot path maps.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The kind of payload stored at an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// An ordinary client payload.
    Data,
    /// An address that was allocated but never written.
    Empty,
    /// A hole fill: seals an address that will never receive real data.
    Hole,
    /// An address discarded by compaction.
    Trimmed,
    /// A rank-only record used for consensus ordering, with no payload.
    RankOnly,
}

/// A position in the shared log, optionally scoped to a stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogAddress {
    /// Global address assigned by an external sequencer.
    pub address: u64,
    /// Stream scope; a scoped address lives in its own segment file family.
    pub stream: Option<Uuid>,
}

impl LogAddress {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            stream: None,
        }
    }

    pub fn with_stream(address: u64, stream: Uuid) -> Self {
        Self {
            address,
            stream: Some(stream),
        }
    }

    /// The segment number backing this address.
    pub fn segment(&self, records_per_file: u64) -> u64 {
        self.address / records_per_file
    }
}

/// A log record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogData {
    pub data_type: DataType,
    pub data: Vec<u8>,
    /// Rank for consensus-style ordering between competing writers.
    pub rank: u64,
    pub commit: bool,
    /// Streams this record belongs to.
    pub streams: BTreeSet<Uuid>,
    /// Per-stream logical position of this record.
    pub logical_addresses: BTreeMap<Uuid, u64>,
    /// Per-stream backpointer to the previous record.
    pub backpointers: BTreeMap<Uuid, u64>,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Data
    }
}

impl LogData {
    pub fn new(data_type: DataType, data: Vec<u8>) -> Self {
        Self {
            data_type,
            data,
            ..Self::default()
        }
    }

    /// A hole fill record: no payload, seals the address.
    pub fn hole() -> Self {
        Self::new(DataType::Hole, Vec::new())
    }
}

/// The on-disk form of a record, serialized with bincode behind the
/// metadata envelope. Field order is the wire schema; do not reorder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct LogEntry {
    pub data_type: DataType,
    pub data: Vec<u8>,
    pub global_address: i64,
    pub rank: i64,
    pub commit: bool,
    pub streams: BTreeSet<String>,
    pub logical_addresses: BTreeMap<String, i64>,
    pub backpointers: BTreeMap<String, i64>,
}

impl LogEntry {
    pub fn from_data(address: u64, data: &LogData) -> Self {
        Self {
            data_type: data.data_type,
            data: data.data.clone(),
            global_address: address as i64,
            rank: data.rank as i64,
            commit: data.commit,
            streams: data.streams.iter().map(Uuid::to_string).collect(),
            logical_addresses: to_text_keys(&data.logical_addresses),
            backpointers: to_text_keys(&data.backpointers),
        }
    }

    pub fn global_address(&self) -> u64 {
        self.global_address as u64
    }

    pub fn into_data(self) -> Result<LogData> {
        let streams = self
            .streams
            .iter()
            .map(|s| parse_stream_id(s))
            .collect::<Result<BTreeSet<Uuid>>>()?;

        Ok(LogData {
            data_type: self.data_type,
            data: self.data,
            rank: self.rank as u64,
            commit: self.commit,
            streams,
            logical_addresses: from_text_keys(self.logical_addresses)?,
            backpointers: from_text_keys(self.backpointers)?,
        })
    }
}

fn to_text_keys(map: &BTreeMap<Uuid, u64>) -> BTreeMap<String, i64> {
    map.iter()
        .map(|(stream, address)| (stream.to_string(), *address as i64))
        .collect()
}

fn from_text_keys(map: BTreeMap<String, i64>) -> Result<BTreeMap<Uuid, u64>> {
    map.into_iter()
        .map(|(stream, address)| Ok((parse_stream_id(&stream)?, address as u64)))
        .collect()
}

fn parse_stream_id(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Corruption(format!("invalid stream id {text:?}: {e}")))
}
