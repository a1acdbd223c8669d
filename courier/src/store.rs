//! Durable ordered queue of location records.
//!
//! Records are kept sorted by creation time. Records sharing a timestamp keep
//! their arrival order. The filesystem store keeps the authoritative copy in
//! memory, appends new records to a log and rewrites its compressed snapshot
//! only when records are removed.
use crate::config::StorageConfig;
use crate::metrics_defs::STORE_DEGRADED;
use crate::types::{Coordinate, LocationRecord, Provenance, Timestamp};
use parking_lot::RwLock;
use shared::counter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const LOCATIONS_FILENAME: &str = "locations.bin";

/// Extension of the append log kept next to the snapshot.
const LOG_EXTENSION: &str = "log";

const SNAPSHOT_VERSION: u8 = 2;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
}

pub trait LocationStore: Send + Sync {
    /// Adds records to the queue. On error the records may only be held in
    /// memory.
    fn append(&self, records: Vec<LocationRecord>) -> Result<(), StoreError>;

    /// The oldest queued record.
    fn earliest(&self) -> Option<LocationRecord>;

    /// All records created strictly after `since`, oldest first.
    fn query(&self, since: Timestamp) -> Vec<LocationRecord>;

    /// Deletes every record created at or before `before`. Returns the number
    /// of deleted records.
    fn prune(&self, before: Timestamp) -> Result<usize, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens the store described by the config. Falls back to a volatile
/// in-memory queue if the durable store cannot be opened, so tracking keeps
/// working without persistence.
pub fn open_location_store(config: &StorageConfig) -> Arc<dyn LocationStore> {
    match config {
        StorageConfig::Memory => Arc::new(MemoryLocationStore::new()),
        StorageConfig::Filesystem { base_dir } => {
            match FilesystemLocationStore::open(Path::new(base_dir), LOCATIONS_FILENAME) {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    tracing::error!(
                        base_dir = %base_dir,
                        error = %err,
                        "could not open location store, queuing in memory only"
                    );
                    counter!(STORE_DEGRADED).increment(1);
                    Arc::new(MemoryLocationStore::new())
                }
            }
        }
    }
}

fn insert_ordered(queue: &mut Vec<LocationRecord>, records: Vec<LocationRecord>) {
    for record in records {
        match queue.last() {
            Some(last) if last.created_at > record.created_at => {
                let idx = queue.partition_point(|r| r.created_at <= record.created_at);
                queue.insert(idx, record);
            }
            _ => queue.push(record),
        }
    }
}

fn records_after(queue: &[LocationRecord], since: Timestamp) -> Vec<LocationRecord> {
    let start = queue.partition_point(|r| r.created_at <= since);
    queue[start..].to_vec()
}

fn prune_queue(queue: &mut Vec<LocationRecord>, before: Timestamp) -> usize {
    let end = queue.partition_point(|r| r.created_at <= before);
    queue.drain(..end).count()
}

/// Volatile queue. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryLocationStore {
    records: RwLock<Vec<LocationRecord>>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationStore for MemoryLocationStore {
    fn append(&self, records: Vec<LocationRecord>) -> Result<(), StoreError> {
        insert_ordered(&mut self.records.write(), records);
        Ok(())
    }

    fn earliest(&self) -> Option<LocationRecord> {
        self.records.read().first().cloned()
    }

    fn query(&self, since: Timestamp) -> Vec<LocationRecord> {
        records_after(&self.records.read(), since)
    }

    fn prune(&self, before: Timestamp) -> Result<usize, StoreError> {
        Ok(prune_queue(&mut self.records.write(), before))
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.records.write().clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// On-disk representation of a record. The payload is stored as JSON text
/// because its shape belongs to the enricher.
#[derive(bincode::Encode, bincode::Decode, Debug, PartialEq)]
struct StoredRecord {
    created_at: i64,
    latitude: f64,
    longitude: f64,
    active: bool,
    payload: String,
}

impl StoredRecord {
    fn from_record(record: &LocationRecord) -> Result<Self, StoreError> {
        Ok(StoredRecord {
            created_at: record.created_at.as_millis(),
            latitude: record.coordinate.latitude,
            longitude: record.coordinate.longitude,
            active: record.provenance == Provenance::Active,
            payload: serde_json::to_string(&record.payload)?,
        })
    }

    fn into_record(self) -> Result<LocationRecord, StoreError> {
        let provenance = if self.active {
            Provenance::Active
        } else {
            Provenance::Passive
        };
        Ok(LocationRecord::new(
            Timestamp::from_millis(self.created_at),
            Coordinate::new(self.latitude, self.longitude),
            provenance,
            serde_json::from_str(&self.payload)?,
        ))
    }
}

#[derive(bincode::Encode, bincode::Decode, Debug, PartialEq)]
struct Snapshot {
    version: u8,
    /// Highest log sequence number folded into `records`.
    log_seq: u64,
    records: Vec<StoredRecord>,
}

/// One appended record. Frames are written back to back, uncompressed.
#[derive(bincode::Encode, bincode::Decode, Debug, PartialEq)]
struct LogFrame {
    seq: u64,
    record: StoredRecord,
}

#[derive(Clone)]
enum Compression {
    #[allow(dead_code)]
    None,
    // zstd with compression level
    Zstd(i32),
}

struct Codec {
    compression: Compression,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec {
            compression,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    fn write<W: Write>(
        &self,
        writer: &mut W,
        records: &[LocationRecord],
        log_seq: u64,
    ) -> Result<usize, StoreError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            log_seq,
            records: records
                .iter()
                .map(StoredRecord::from_record)
                .collect::<Result<_, _>>()?,
        };

        match self.compression {
            Compression::None => {
                let size = bincode::encode_into_std_write(&snapshot, writer, self.config)?;
                writer.flush()?;
                Ok(size)
            }
            Compression::Zstd(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                let size = bincode::encode_into_std_write(&snapshot, &mut encoder, self.config)?;
                encoder.finish()?;
                Ok(size)
            }
        }
    }

    /// Returns the records and the log sequence number they include.
    fn read<R: Read>(&self, mut reader: R) -> Result<(Vec<LocationRecord>, u64), StoreError> {
        let snapshot: Snapshot = match self.compression {
            Compression::None => bincode::decode_from_std_read(&mut reader, self.config)?,
            Compression::Zstd(_) => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                bincode::decode_from_std_read(&mut decoder, self.config)?
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(snapshot.version));
        }

        let records = snapshot
            .records
            .into_iter()
            .map(StoredRecord::into_record)
            .collect::<Result<_, _>>()?;
        Ok((records, snapshot.log_seq))
    }

    fn encode_frames(
        &self,
        records: &[LocationRecord],
        first_seq: u64,
    ) -> Result<Vec<u8>, StoreError> {
        let mut buffer = Vec::new();
        for (seq, record) in (first_seq..).zip(records) {
            let frame = LogFrame {
                seq,
                record: StoredRecord::from_record(record)?,
            };
            bincode::encode_into_std_write(&frame, &mut buffer, self.config)?;
        }
        Ok(buffer)
    }

    /// Decodes frames until the end of `data` or the first frame that cannot
    /// be decoded, which is where a crash tore the last write. Returns the
    /// frames and the length of the intact prefix.
    fn decode_frames(&self, data: &[u8]) -> (Vec<LogFrame>, usize) {
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match bincode::decode_from_slice::<LogFrame, _>(&data[offset..], self.config) {
                Ok((frame, read)) => {
                    frames.push(frame);
                    offset += read;
                }
                Err(err) => {
                    tracing::warn!(
                        offset,
                        discarded = data.len() - offset,
                        error = %err,
                        "discarding torn tail of location log"
                    );
                    break;
                }
            }
        }
        (frames, offset)
    }
}

/// Queue persisted as a zstd-compressed snapshot plus an append log.
///
/// Appends write only the new records to the log. Prune and clear write a
/// fresh snapshot (temporary file, then rename) and empty the log. Every log
/// frame carries a sequence number and the snapshot records the last one it
/// includes, so frames left behind by an interrupted compaction are skipped
/// on replay.
pub struct FilesystemLocationStore {
    path: PathBuf,
    log: File,
    codec: Codec,
    records: RwLock<Vec<LocationRecord>>,
    log_seq: AtomicU64,
}

impl FilesystemLocationStore {
    pub fn open(base_dir: &Path, filename: &str) -> Result<Self, StoreError> {
        fs::create_dir_all(base_dir)?;
        let path = base_dir.join(filename);
        let log_path = path.with_extension(LOG_EXTENSION);
        let codec = Codec::new(Compression::Zstd(1));

        let (mut records, snapshot_seq) = if path.exists() {
            let file = File::open(&path)?;
            codec.read(BufReader::new(file))?
        } else {
            (Vec::new(), 0)
        };

        let data = match fs::read(&log_path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let (frames, intact) = codec.decode_frames(&data);

        let mut log_seq = snapshot_seq;
        let mut replayed = 0;
        for frame in frames {
            if frame.seq <= snapshot_seq {
                continue;
            }
            log_seq = log_seq.max(frame.seq);
            insert_ordered(&mut records, vec![frame.record.into_record()?]);
            replayed += 1;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        if intact < data.len() {
            log.set_len(intact as u64)?;
        }

        tracing::info!(
            path = ?path,
            records = records.len(),
            replayed,
            "opened location store"
        );

        Ok(FilesystemLocationStore {
            path,
            log,
            codec,
            records: RwLock::new(records),
            log_seq: AtomicU64::new(log_seq),
        })
    }

    /// Writes `records` as the new snapshot and empties the log. Callers hold
    /// the write lock.
    fn compact(&self, records: &[LocationRecord]) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        let log_seq = self.log_seq.load(Ordering::SeqCst);
        let size = self.codec.write(&mut writer, records, log_seq)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        self.log.set_len(0)?;
        self.log.sync_all()?;

        tracing::debug!(path = ?self.path, records = records.len(), bytes = size, "compacted location store");
        Ok(())
    }
}

impl LocationStore for FilesystemLocationStore {
    fn append(&self, records: Vec<LocationRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut guard = self.records.write();
        let first_seq = self.log_seq.load(Ordering::SeqCst) + 1;
        let frames = self.codec.encode_frames(&records, first_seq)?;
        self.log_seq
            .store(first_seq + records.len() as u64 - 1, Ordering::SeqCst);
        insert_ordered(&mut guard, records);

        (&self.log).write_all(&frames)?;
        self.log.sync_data()?;
        Ok(())
    }

    fn earliest(&self) -> Option<LocationRecord> {
        self.records.read().first().cloned()
    }

    fn query(&self, since: Timestamp) -> Vec<LocationRecord> {
        records_after(&self.records.read(), since)
    }

    fn prune(&self, before: Timestamp) -> Result<usize, StoreError> {
        let mut guard = self.records.write();
        let removed = prune_queue(&mut guard, before);
        if removed > 0 {
            self.compact(&guard)?;
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.records.write();
        guard.clear();
        self.compact(&guard)
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}
