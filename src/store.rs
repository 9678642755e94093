//! The log store: segment routing, the segment cache, and the public
//! append / read / trim / sync / compact surface.
//!
//! # Directory Layout
//!
//! ```text
//! logDir/
//!   streamlog.lock                   process-exclusive advisory lock
//!   <segment>.log                    data (header + framed entries)
//!   <segment>.log.trimmed            confirmed trims
//!   <segment>.log.pending            pending trims
//!   <stream>-<segment>.log           stream-scoped family, same sidecars
//! ```
//!
//! # Concurrency
//!
//! The segment cache is a map guarded by one mutex; the first access to a
//! segment performs the full open-and-recover sequence inside the critical
//! section. Appends serialise on the per-segment lock. Reads of indexed
//! records go straight to disk through fresh read-only descriptors and take
//! no lock. `sync` flushes exactly the channels written since the last
//! sync, tracked in a process-wide dirty set.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, trace};

use crate::compaction;
use crate::config::LogConfig;
use crate::entry::{LogAddress, LogData};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::format;
use crate::segment::{self, AddressMetaData, SegmentHandle};

const LOCK_FILE: &str = "streamlog.lock";

/// Durable, write-once backing for a shared log, persisted as segment files.
///
/// Every address accepts exactly one append, rejected with
/// [`Error::Overwrite`] afterwards, including after the address has been
/// trimmed away. Appends are durable once [`LogStore::sync`] returns.
pub struct LogStore {
    config: LogConfig,
    lock: Option<FileLock>,
    /// Open segments, one entry per segment touched this process lifetime.
    segments: Mutex<HashMap<PathBuf, Arc<SegmentHandle>>>,
    /// Channels written since the last sync, keyed by channel identity.
    dirty: Mutex<HashMap<usize, Arc<File>>>,
}

impl LogStore {
    /// Opens the store, verifying the header of every existing segment.
    ///
    /// Fails if any segment carries a bad header checksum, an unknown
    /// version, or was written without checksums while this store verifies.
    pub fn open(config: LogConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        Self::discard_copies(&config.dir)?;
        Self::verify_logs(&config)?;

        Ok(Self {
            config,
            lock: Some(lock),
            segments: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashMap::new()),
        })
    }

    /// Removes scratch copies left behind by a compaction that never reached
    /// its atomic rename. Only the authoritative `.log` files are replayed.
    fn discard_copies(dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "copy") {
                debug!(path = %path.display(), "discarding torn compaction copy");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn verify_logs(config: &LogConfig) -> Result<()> {
        for entry in fs::read_dir(&config.dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "log") {
                continue;
            }
            let mut reader = BufReader::new(File::open(&path)?);
            let header = format::decode_header(&mut reader).map_err(|e| {
                error!(path = %path.display(), error = %e, "bad segment header");
                e
            })?;
            segment::check_header(&header, config.no_verify, &path)?;
        }
        Ok(())
    }

    fn segment_path(&self, address: &LogAddress) -> PathBuf {
        let segment = address.segment(self.config.records_per_file);
        let name = match &address.stream {
            Some(stream) => format!("{stream}-{segment}.log"),
            None => format!("{segment}.log"),
        };
        self.config.dir.join(name)
    }

    /// Returns the handle for the segment backing `address`, opening and
    /// recovering it on first use.
    fn segment_handle(&self, address: &LogAddress) -> Result<Arc<SegmentHandle>> {
        let path = self.segment_path(address);
        let mut segments = self.segments.lock()?;

        if let Some(handle) = segments.get(&path) {
            return Ok(handle.clone());
        }

        let handle = Arc::new(SegmentHandle::open(&path, self.config.no_verify)?);
        trace!(path = %path.display(), "opened segment");
        segments.insert(path, handle.clone());
        Ok(handle)
    }

    fn mark_dirty(&self, channel: &Arc<File>) -> Result<()> {
        self.dirty
            .lock()?
            .insert(Arc::as_ptr(channel) as usize, channel.clone());
        Ok(())
    }

    /// Appends `data` at `address`.
    ///
    /// Fails with [`Error::Overwrite`] if the address was ever written or
    /// trimmed in its segment. The write is not guaranteed durable until
    /// [`LogStore::sync`] returns.
    pub fn append(&self, address: &LogAddress, data: &LogData) -> Result<AddressMetaData> {
        let handle = self.segment_handle(address)?;

        if handle.is_known(address.address)? || handle.is_trimmed(address.address)? {
            return Err(Error::Overwrite(address.address));
        }

        let meta = handle.append(address.address, data)?;
        self.mark_dirty(handle.log_channel())?;
        trace!(address = address.address, "written to disk");
        Ok(meta)
    }

    /// Reads the record at `address`.
    ///
    /// Fails with [`Error::Trimmed`] once a trim has been requested for the
    /// address, even before compaction runs. Returns `None` for an address
    /// that was never written.
    pub fn read(&self, address: &LogAddress) -> Result<Option<LogData>> {
        let handle = self.segment_handle(address)?;

        if handle.is_pending_trim(address.address)? {
            return Err(Error::Trimmed(address.address));
        }

        handle.read_record(address.address)
    }

    /// Records a trim intent for `address`.
    ///
    /// A no-op when the address was never written or is already pending: a
    /// trim ahead of the writer never records the intent.
    pub fn trim(&self, address: &LogAddress) -> Result<()> {
        let handle = self.segment_handle(address)?;

        if !handle.is_known(address.address)? || handle.is_pending_trim(address.address)? {
            return Ok(());
        }

        handle.record_pending_trim(address.address)?;
        self.mark_dirty(handle.pending_channel())?;
        Ok(())
    }

    /// Forces every channel written since the last sync.
    pub fn sync(&self) -> Result<()> {
        let drained: Vec<Arc<File>> = {
            let mut dirty = self.dirty.lock()?;
            dirty.drain().map(|(_, channel)| channel).collect()
        };
        for channel in &drained {
            channel.sync_all()?;
        }
        debug!(channels = drained.len(), "synced channels");
        Ok(())
    }

    /// Rewrites every full segment whose distinct pending trims reach the
    /// configured threshold, reclaiming the trimmed space.
    ///
    /// A failed segment rewrite is logged and skipped; the sweep visits the
    /// remaining segments regardless.
    pub fn compact(&self) -> Result<()> {
        let handles: Vec<Arc<SegmentHandle>> =
            { self.segments.lock()?.values().cloned().collect() };

        for handle in handles {
            let trimmed = handle.trimmed_addresses()?;
            let mut pending = handle.pending_trims()?;

            if handle.known_count()? + trimmed.len() != self.config.records_per_file as usize {
                debug!(segment = %handle.path().display(), "segment not yet complete, skipping");
                continue;
            }

            pending.retain(|address| !trimmed.contains(address));
            if pending.len() < self.config.trim_threshold {
                trace!(
                    pending = pending.len(),
                    threshold = self.config.trim_threshold,
                    "trim threshold not reached"
                );
                continue;
            }

            info!(
                segment = %handle.path().display(),
                pending = pending.len(),
                "starting compaction"
            );
            if let Err(e) = compaction::compact_segment(&handle, &pending, self.config.no_verify) {
                error!(segment = %handle.path().display(), error = %e, "compaction failed");
                continue;
            }

            // Force a reload of the rewritten segment on next access.
            self.segments.lock()?.remove(handle.path());
        }

        Ok(())
    }

    /// Reserved for read caches; the file-backed store has nothing to
    /// release.
    pub fn release(&self, _address: &LogAddress, _data: &LogData) {}

    /// Forces and drops every open segment handle.
    pub fn close(&self) -> Result<()> {
        let handles: Vec<Arc<SegmentHandle>> = {
            self.segments.lock()?.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.close();
        }
        self.dirty.lock()?.clear();
        Ok(())
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        let _ = self.close();
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
    }
}
