use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tide_types::{Invalidation, ObjectRecord, Oid, Tid};

use crate::error::{StoreError, StoreResult};
use crate::traits::StorageBackend;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Flush/sync strategy for committed transactions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// `fsync` after every committed transaction.
    #[default]
    EveryCommit,
    /// Rely on OS page-cache buffering (fastest, least durable).
    OsDefault,
}

/// Configuration for [`FileBackend`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileBackendConfig {
    pub sync_mode: SyncMode,
    pub read_only: bool,
}

/// One committed transaction as written to the log.
///
/// On-disk format:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized TransactionRecord)]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct TransactionRecord {
    tid: Tid,
    writes: Vec<(Oid, Vec<u8>)>,
}

/// Where the newest state of an object lives in the log.
#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    tid: Tid,
    offset: u64,
}

#[derive(Default)]
struct FileIndex {
    objects: HashMap<Oid, IndexEntry>,
    history: Vec<Invalidation>,
    current: Tid,
    next_oid: Oid,
}

impl FileIndex {
    fn apply(&mut self, record: &TransactionRecord, offset: u64) {
        let mut oids = Vec::with_capacity(record.writes.len());
        for (oid, _) in &record.writes {
            self.objects.insert(
                *oid,
                IndexEntry {
                    tid: record.tid,
                    offset,
                },
            );
            if *oid >= self.next_oid {
                self.next_oid = oid.next();
            }
            oids.push(*oid);
        }
        self.history.push(Invalidation::new(record.tid, oids));
        self.current = record.tid;
    }
}

struct LogWriter {
    file: File,
    /// End of the last complete record.
    offset: u64,
    /// Set when a failed append could not be rolled back.
    broken: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl LogWriter {
    fn new(file: File, offset: u64) -> Self {
        Self {
            file,
            offset,
            broken: false,
            #[cfg(test)]
            fail_after: None,
        }
    }

    /// Write one framed record. On error nothing past `offset` survives.
    fn append(&mut self, frame: &[u8], sync: bool) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("log is in an unknown state; reopen the store"));
        }
        match self.write_frame(frame, sync) {
            Ok(()) => {
                self.offset += frame.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(trunc) = self.file.set_len(self.offset) {
                    warn!(error = %trunc, offset = self.offset, "cannot roll back failed append");
                    self.broken = true;
                } else {
                    warn!(error = %err, offset = self.offset, "append failed; log rolled back");
                }
                Err(err)
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8], sync: bool) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(frame)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Append-only, single-file transaction log.
///
/// Every committed transaction is one CRC-framed record. On open the log is
/// replayed front-to-back to rebuild an in-memory index of
/// `oid -> (tid, record offset)`; a torn or corrupt tail (a crash mid-append)
/// is truncated away, so a transaction is either fully present or absent.
/// Loads read the record back from disk.
pub struct FileBackend {
    path: PathBuf,
    config: FileBackendConfig,
    writer: Mutex<LogWriter>,
    index: RwLock<FileIndex>,
}

impl FileBackend {
    /// Open (or create) a log at the given path and replay it.
    pub fn open(path: &Path, config: FileBackendConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|_| StoreError::PathNotAccessible(path.to_path_buf()))?;

        let file_len = file.metadata()?.len();
        let (records, good_len) = scan_log(path, file_len)?;
        if good_len < file_len {
            warn!(
                path = %path.display(),
                good_len,
                file_len,
                "discarding torn tail of transaction log"
            );
            file.set_len(good_len)?;
        }

        let mut index = FileIndex::default();
        for (offset, record) in &records {
            index.apply(record, *offset);
        }

        info!(
            path = %path.display(),
            transactions = records.len(),
            objects = index.objects.len(),
            current_tid = %index.current,
            "file store opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            config,
            writer: Mutex::new(LogWriter::new(file, good_len)),
            index: RwLock::new(index),
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes.
    pub fn offset(&self) -> u64 {
        self.writer.lock().expect("log mutex poisoned").offset
    }

    fn read_record(&self, offset: u64) -> StoreResult<TransactionRecord> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        let (length, expected_crc) = split_header(&header);
        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(StoreError::Corrupt {
                offset,
                reason: format!("crc {actual_crc:#010x} != {expected_crc:#010x}"),
            });
        }
        bincode::deserialize(&payload).map_err(|e| StoreError::Corrupt {
            offset,
            reason: e.to_string(),
        })
    }
}

fn split_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (length, crc)
}

/// Read every intact record. Returns the records with their offsets and the
/// length of the valid prefix of the file.
fn scan_log(path: &Path, file_len: u64) -> StoreResult<(Vec<(u64, TransactionRecord)>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let (length, expected_crc) = split_header(&header);
        if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
            warn!(offset, length, file_len, "invalid record length; stopping replay");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated record; stopping replay");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; stopping replay"
            );
            break;
        }

        match bincode::deserialize::<TransactionRecord>(&payload) {
            Ok(record) => records.push((offset, record)),
            Err(e) => {
                warn!(offset, error = %e, "undecodable record; stopping replay");
                break;
            }
        }
        offset += HEADER_SIZE as u64 + length as u64;
    }

    debug!(recovered = records.len(), "transaction log replay complete");
    Ok((records, offset))
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self, oid: Oid) -> StoreResult<Option<ObjectRecord>> {
        let entry = {
            let index = self.index.read().expect("index lock poisoned");
            match index.objects.get(&oid) {
                Some(entry) => *entry,
                None => return Ok(None),
            }
        };
        let record = self.read_record(entry.offset)?;
        let state = record
            .writes
            .into_iter()
            .find(|(o, _)| *o == oid)
            .map(|(_, data)| data)
            .ok_or_else(|| StoreError::Corrupt {
                offset: entry.offset,
                reason: format!("record for {} does not contain oid {oid}", entry.tid),
            })?;
        Ok(Some(ObjectRecord::new(oid, entry.tid, state)))
    }

    fn tid_of(&self, oid: Oid) -> StoreResult<Option<Tid>> {
        let index = self.index.read().expect("index lock poisoned");
        Ok(index.objects.get(&oid).map(|e| e.tid))
    }

    fn store_batch(&self, tid: Tid, writes: &[(Oid, Vec<u8>)]) -> StoreResult<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if writes.is_empty() {
            return Err(StoreError::EmptyBatch(tid));
        }

        let mut w = self.writer.lock().expect("log mutex poisoned");
        let current = self.index.read().expect("index lock poisoned").current;
        if !tid.is_after(&current) {
            return Err(StoreError::NonMonotonicTid {
                offered: tid,
                current,
            });
        }

        let record = TransactionRecord {
            tid,
            writes: writes.to_vec(),
        };
        let payload =
            bincode::serialize(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        let record_offset = w.offset;

        w.append(&frame, self.config.sync_mode == SyncMode::EveryCommit)?;

        self.index
            .write()
            .expect("index lock poisoned")
            .apply(&record, record_offset);

        debug!(%tid, objects = writes.len(), offset = record_offset, "transaction appended");
        Ok(())
    }

    fn current_tid(&self) -> StoreResult<Tid> {
        Ok(self.index.read().expect("index lock poisoned").current)
    }

    fn iterate_since(&self, since: Tid) -> StoreResult<Vec<Invalidation>> {
        let index = self.index.read().expect("index lock poisoned");
        let start = index.history.partition_point(|inv| !inv.tid.is_after(&since));
        Ok(index.history[start..].to_vec())
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        let mut index = self.index.write().expect("index lock poisoned");
        let oid = index.next_oid;
        index.next_oid = oid.next();
        Ok(oid)
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish()
    }
}
