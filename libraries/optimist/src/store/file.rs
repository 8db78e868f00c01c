//! A directory-backed store: an append-only binary outbox log plus a JSON cache snapshot.
//!
//! `outbox.log` layout: the magic `OPTOUTBX`, a little-endian u32 version, then records of
//! `u32 len | u8 op | u32 id_len | id | u32 payload_len | payload`, where `len` covers everything
//! after itself. A put carries the JSON-encoded [`PendingMutationRecord`]; a delete carries no
//! payload. The live set is the last put per id that no later delete removed.

use std::cell::RefCell;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tokio::io::AsyncWriteExt;

use super::DurableStore;
use crate::cache::CacheSnapshot;
use crate::error::StoreError;
use crate::queue::PendingMutationRecord;

pub const OUTBOX_FILE_NAME: &str = "outbox.log";
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.json";
const OUTBOX_LOG_MAGIC: &[u8] = b"OPTOUTBX";
pub const OUTBOX_LOG_VERSION: u32 = 1;
const OUTBOX_LOG_HEADER_LEN: usize = OUTBOX_LOG_MAGIC.len() + 4;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxLogEntry {
    pub op: LogOp,
    pub client_mutation_id: String,
    /// Present for puts.
    pub record: Option<PendingMutationRecord>,
}

#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    /// Mirror of the log's live set, loaded on first use.
    live: RefCell<Option<IndexMap<String, PendingMutationRecord>>>,
    io_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Failed to create store directory {}: {e:?}",
                    directory.display()
                )
            })?;
        Ok(Self {
            directory,
            live: RefCell::new(None),
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.directory.join(OUTBOX_FILE_NAME)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.directory.join(SNAPSHOT_FILE_NAME)
    }

    async fn ensure_loaded(&self) -> Result<(), StoreError> {
        if self.live.borrow().is_some() {
            return Ok(());
        }
        let bytes = match tokio::fs::read(self.outbox_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let scanned = scan_outbox_log(&bytes);
        let live = live_records(scanned.entries);
        if scanned.complete_len < bytes.len() {
            // Appending after a torn entry would hide every later write behind its length prefix.
            log::warn!(
                "Outbox log has {} unreadable trailing bytes, rewriting it with {} live records",
                bytes.len() - scanned.complete_len,
                live.len()
            );
            self.rewrite(live.values().cloned().collect()).await?;
        }
        *self.live.borrow_mut() = Some(live);
        Ok(())
    }

    async fn append(&self, entry: Vec<u8>) -> Result<(), StoreError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_path())
            .await?;

        let existing_size = file.metadata().await?.len();
        if existing_size < OUTBOX_LOG_HEADER_LEN as u64 {
            if existing_size > 0 {
                log::warn!("Outbox log header was incomplete ({existing_size} bytes), rewriting");
            }
            file.set_len(0).await?;
            file.write_all(&outbox_log_header_bytes()).await?;
        }

        file.write_all(&entry).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the log from scratch, containing only the given records.
    async fn rewrite(&self, records: Vec<PendingMutationRecord>) -> Result<(), StoreError> {
        let mut bytes = outbox_log_header_bytes();
        for record in &records {
            let payload = serde_json::to_vec(record)?;
            if let Some(entry) = encode_entry(OP_PUT, &record.client_mutation_id, &payload) {
                bytes.extend_from_slice(&entry);
            }
        }
        write_atomically(&self.outbox_path(), &bytes).await
    }

    /// Drop superseded puts and deletes from the log. Returns the number of live records kept.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _guard = self.io_lock.lock().await;
        self.ensure_loaded().await?;
        let records: Vec<_> = self
            .live
            .borrow()
            .as_ref()
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default();
        let kept = records.len();
        self.rewrite(records).await?;
        log::info!("Compacted outbox log to {kept} live records");
        Ok(kept)
    }
}

impl DurableStore for FileStore {
    async fn put_pending(&self, record: &PendingMutationRecord) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        self.ensure_loaded().await?;

        let payload = serde_json::to_vec(record)?;
        let entry = encode_entry(OP_PUT, &record.client_mutation_id, &payload).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "record {} is too large to encode",
                record.client_mutation_id
            ))
        })?;
        self.append(entry).await?;

        if let Some(live) = self.live.borrow_mut().as_mut() {
            live.insert(record.client_mutation_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_pending(&self, client_mutation_id: &str) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        self.ensure_loaded().await?;

        let now_empty = {
            let mut live = self.live.borrow_mut();
            let Some(live) = live.as_mut() else {
                return Ok(());
            };
            if live.shift_remove(client_mutation_id).is_none() {
                return Ok(());
            }
            live.is_empty()
        };

        if now_empty {
            // Nothing is pending any more, so the whole history can go.
            return self.rewrite(Vec::new()).await;
        }

        let entry = encode_entry(OP_DELETE, client_mutation_id, &[]).ok_or_else(|| {
            StoreError::Corrupt(format!("mutation id {client_mutation_id} is too long"))
        })?;
        self.append(entry).await
    }

    async fn all_pending(&self) -> Result<Vec<PendingMutationRecord>, StoreError> {
        let _guard = self.io_lock.lock().await;
        self.ensure_loaded().await?;
        Ok(self
            .live
            .borrow()
            .as_ref()
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_snapshot(&self, snapshot: &CacheSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(snapshot)?;
        write_atomically(&self.snapshot_path(), &bytes).await
    }

    async fn snapshot(&self) -> Result<Option<CacheSnapshot>, StoreError> {
        let bytes = match tokio::fs::read(self.snapshot_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn outbox_log_header_bytes() -> Vec<u8> {
    let mut header = Vec::with_capacity(OUTBOX_LOG_HEADER_LEN);
    header.extend_from_slice(OUTBOX_LOG_MAGIC);
    header.extend_from_slice(&OUTBOX_LOG_VERSION.to_le_bytes());
    header
}

fn encode_entry(op: u8, client_mutation_id: &str, payload: &[u8]) -> Option<Vec<u8>> {
    let id_bytes = client_mutation_id.as_bytes();
    let id_len: u32 = match id_bytes.len().try_into() {
        Ok(len) => len,
        Err(_) => {
            log::error!("Mutation id too long to encode ({} bytes)", id_bytes.len());
            return None;
        }
    };
    let payload_len: u32 = match payload.len().try_into() {
        Ok(len) => len,
        Err(_) => {
            log::error!(
                "Outbox payload too large to encode for {client_mutation_id} ({} bytes)",
                payload.len()
            );
            return None;
        }
    };

    let body_len = 1 + 4 + id_bytes.len() + 4 + payload.len();
    let record_len: u32 = body_len.try_into().ok()?;

    let mut buffer = Vec::with_capacity(4 + body_len);
    buffer.extend_from_slice(&record_len.to_le_bytes());
    buffer.push(op);
    buffer.extend_from_slice(&id_len.to_le_bytes());
    buffer.extend_from_slice(id_bytes);
    buffer.extend_from_slice(&payload_len.to_le_bytes());
    buffer.extend_from_slice(payload);
    Some(buffer)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

/// The log's format version, or `None` if the header is missing or not ours.
pub fn outbox_log_version(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < OUTBOX_LOG_HEADER_LEN || !bytes.starts_with(OUTBOX_LOG_MAGIC) {
        return None;
    }
    read_u32(bytes, OUTBOX_LOG_MAGIC.len())
}

/// Every well-formed entry in log order. Malformed entries are skipped; a truncated tail ends
/// parsing.
pub fn parse_outbox_log(bytes: &[u8]) -> Vec<OutboxLogEntry> {
    scan_outbox_log(bytes).entries
}

struct ScannedLog {
    entries: Vec<OutboxLogEntry>,
    /// Length of the prefix made of the header and complete entries. Zero for a foreign file.
    complete_len: usize,
}

fn scan_outbox_log(bytes: &[u8]) -> ScannedLog {
    let unreadable = ScannedLog {
        entries: Vec::new(),
        complete_len: 0,
    };
    if bytes.is_empty() {
        return unreadable;
    }

    match outbox_log_version(bytes) {
        Some(OUTBOX_LOG_VERSION) => {}
        Some(version) => {
            log::warn!("Unsupported outbox log version {version}");
            return unreadable;
        }
        None => {
            log::warn!(
                "Outbox log header missing or invalid ({} bytes)",
                bytes.len()
            );
            return unreadable;
        }
    }

    let mut offset = OUTBOX_LOG_HEADER_LEN;
    let mut complete_len = offset;
    let mut entries = Vec::new();

    while let Some(record_len) = read_u32(bytes, offset) {
        let record_len = record_len as usize;
        offset += 4;

        if offset + record_len > bytes.len() {
            log::warn!(
                "Outbox record length {record_len} exceeds remaining bytes {}",
                bytes.len() - offset
            );
            break;
        }
        let record_end = offset + record_len;
        let record = &bytes[offset..record_end];
        offset = record_end;
        complete_len = record_end;

        match parse_entry(record) {
            Ok(entry) => entries.push(entry),
            Err(reason) => log::warn!("Skipping malformed outbox record: {reason}"),
        }
    }

    if complete_len < bytes.len() {
        log::warn!(
            "Ignoring {} trailing bytes in outbox log",
            bytes.len() - complete_len
        );
    }

    ScannedLog {
        entries,
        complete_len,
    }
}

fn parse_entry(record: &[u8]) -> Result<OutboxLogEntry, String> {
    let op = match record.first() {
        Some(&OP_PUT) => LogOp::Put,
        Some(&OP_DELETE) => LogOp::Delete,
        Some(other) => return Err(format!("unknown op {other}")),
        None => return Err("empty record".to_string()),
    };

    let id_len = read_u32(record, 1).ok_or("record too small for id length")? as usize;
    let id_start = 5;
    let id_bytes = record
        .get(id_start..id_start + id_len)
        .ok_or_else(|| format!("id length {id_len} exceeds record bounds"))?;
    let client_mutation_id =
        String::from_utf8(id_bytes.to_vec()).map_err(|e| format!("id was not UTF-8: {e}"))?;

    let payload_start = id_start + id_len;
    let payload_len =
        read_u32(record, payload_start).ok_or("record too small for payload length")? as usize;
    let payload = record
        .get(payload_start + 4..payload_start + 4 + payload_len)
        .ok_or_else(|| format!("payload length {payload_len} exceeds record bounds"))?;

    let record = match op {
        LogOp::Put => {
            let record: PendingMutationRecord = serde_json::from_slice(payload)
                .map_err(|e| format!("payload for {client_mutation_id} did not parse: {e}"))?;
            if record.client_mutation_id != client_mutation_id {
                return Err(format!(
                    "payload id {} does not match entry id {client_mutation_id}",
                    record.client_mutation_id
                ));
            }
            Some(record)
        }
        LogOp::Delete => None,
    };

    Ok(OutboxLogEntry {
        op,
        client_mutation_id,
        record,
    })
}

/// Replay entries into the set of records still pending.
pub fn live_records(
    entries: impl IntoIterator<Item = OutboxLogEntry>,
) -> IndexMap<String, PendingMutationRecord> {
    let mut live = IndexMap::new();
    for entry in entries {
        match (entry.op, entry.record) {
            (LogOp::Put, Some(record)) => {
                live.insert(entry.client_mutation_id, record);
            }
            (LogOp::Delete, _) => {
                live.shift_remove(&entry.client_mutation_id);
            }
            (LogOp::Put, None) => {}
        }
    }
    live
}
