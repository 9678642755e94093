//! Segment compaction: rewrite a full segment without its pending-trimmed
//! entries and promote the pending trims to confirmed.
//!
//! The rewrite never touches the live file in place:
//!
//! 1. Replay the segment read-only, keeping entries whose address is not
//!    pending-trimmed.
//! 2. Write `<path>.copy` with a fresh header and the kept entries in their
//!    original order, then force it.
//! 3. Append every pending address to the `.trimmed` sidecar and force it.
//! 4. Atomically rename `<path>.copy` over `<path>`.
//!
//! A crash before step 4 leaves the original segment authoritative: the
//! scratch copy is discarded on the next startup, and the `.trimmed`
//! appends from step 3 are idempotent (duplicates collapse on set insert).
//! Observers therefore see either the pre-compaction byte stream or the
//! fully compacted one, never a partial rewrite.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use tracing::debug;

use crate::entry::LogEntry;
use crate::error::Result;
use crate::format::{self, LogHeader, Metadata, METADATA_SIZE, RECORD_DELIMITER};
use crate::segment::{self, SegmentHandle};

/// Rewrites `handle`'s data file without the entries in `pending` and
/// records those addresses as confirmed trims.
///
/// Runs without the per-segment lock; atomicity comes from the scratch copy
/// and the final rename. The caller evicts the handle afterwards so the
/// next access re-opens and re-indexes the rewritten file.
pub fn compact_segment(
    handle: &SegmentHandle,
    pending: &HashSet<u64>,
    no_verify: bool,
) -> Result<()> {
    let path = handle.path();
    let (header, live) = collect_live_entries(path, pending, no_verify)?;

    let copy_path = segment::copy_path(path);
    let mut copy = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&copy_path)?;
    copy.write_all(&format::encode_header(&header))?;
    for entry in &live {
        let (_, framed) = format::frame_record(entry)?;
        copy.write_all(&framed)?;
    }
    copy.sync_all()?;
    drop(copy);

    for address in pending {
        handle.record_trimmed(*address)?;
    }
    handle.trimmed_channel().sync_all()?;

    fs::rename(&copy_path, path)?;
    debug!(
        segment = %path.display(),
        kept = live.len(),
        dropped = pending.len(),
        "compacted segment"
    );
    Ok(())
}

/// Replays a segment and returns its header plus the entries that survive
/// the trim set, in original order.
fn collect_live_entries(
    path: &Path,
    pending: &HashSet<u64>,
    no_verify: bool,
) -> Result<(LogHeader, Vec<LogEntry>)> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = format::decode_header(&mut reader)?;

    let mut live = Vec::new();
    loop {
        match reader.read_u16::<BigEndian>() {
            Ok(delimiter) if delimiter == RECORD_DELIMITER => {}
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let mut envelope = [0u8; METADATA_SIZE];
        match reader.read_exact(&mut envelope) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let metadata = Metadata::decode(&envelope)?;

        let mut body = vec![0u8; metadata.length as usize];
        match reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let entry = format::decode_entry(&metadata, &body, !no_verify)?;
        if !pending.contains(&entry.global_address()) {
            live.push(entry);
        }
    }

    Ok((header, live))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DataType, LogData};
    use crate::tmpfs::TempDir;

    fn filled_segment(dir: &TempDir, addresses: std::ops::Range<u64>) -> Result<SegmentHandle> {
        let handle = SegmentHandle::open(&dir.path().join("0.log"), false)?;
        for address in addresses {
            handle.append(address, &LogData::new(DataType::Data, vec![address as u8; 32]))?;
        }
        Ok(handle)
    }

    #[test]
    fn test_compaction_drops_pending_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let handle = filled_segment(&dir, 0..10)?;
        let pending: HashSet<u64> = (0..4).collect();

        let size_before = fs::metadata(handle.path())?.len();
        compact_segment(&handle, &pending, false)?;
        assert!(fs::metadata(handle.path())?.len() < size_before);

        // The rewritten file indexes only the survivors, and the pending
        // set has been promoted to confirmed trims.
        let reopened = SegmentHandle::open(handle.path(), false)?;
        assert_eq!(reopened.known_count()?, 6);
        for address in 0..4 {
            assert!(!reopened.is_known(address)?);
            assert!(reopened.is_trimmed(address)?);
        }
        for address in 4..10 {
            assert_eq!(
                reopened.read_record(address)?,
                Some(LogData::new(DataType::Data, vec![address as u8; 32]))
            );
        }
        Ok(())
    }

    #[test]
    fn test_compaction_preserves_order() -> Result<()> {
        let dir = TempDir::new()?;
        let handle = filled_segment(&dir, 0..6)?;
        let pending: HashSet<u64> = [1, 3].into_iter().collect();

        compact_segment(&handle, &pending, false)?;

        let (_, live) = collect_live_entries(handle.path(), &HashSet::new(), false)?;
        let addresses: Vec<u64> = live.iter().map(LogEntry::global_address).collect();
        assert_eq!(addresses, vec![0, 2, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_scratch_copy_is_replaced() -> Result<()> {
        let dir = TempDir::new()?;
        let handle = filled_segment(&dir, 0..4)?;
        let pending: HashSet<u64> = [0].into_iter().collect();

        compact_segment(&handle, &pending, false)?;
        assert!(!segment::copy_path(handle.path()).exists());
        Ok(())
    }
}
