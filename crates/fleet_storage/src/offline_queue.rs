#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fleet_contracts::event::EventDraft;
use fleet_contracts::ids::LocalEventId;
use fleet_contracts::UnixMs;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub const OFFLINE_QUEUE_FILE_NAME: &str = "offline_events.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryState {
    /// Waiting for the next sync pass.
    Pending,
    /// Hit the retry ceiling. Kept until re-armed; never dropped unacknowledged.
    DeadLetter,
    /// The ingestion boundary refused the payload. Kept for inspection, never retried.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub local_id: LocalEventId,
    pub draft: EventDraft,
    pub enqueued_at: UnixMs,
    pub attempt_count: u16,
    pub next_attempt_at: UnixMs,
    pub last_error: Option<String>,
    pub state: QueueEntryState,
}

impl QueueEntry {
    pub fn v1(local_id: LocalEventId, draft: EventDraft, enqueued_at: UnixMs) -> Self {
        Self {
            local_id,
            draft,
            enqueued_at,
            attempt_count: 0,
            next_attempt_at: enqueued_at,
            last_error: None,
            state: QueueEntryState::Pending,
        }
    }

    pub fn is_due(&self, now: UnixMs) -> bool {
        self.state == QueueEntryState::Pending && self.next_attempt_at <= now
    }
}

/// Backing medium for the offline queue. The whole queue is one JSON array.
pub trait OfflineQueueStore: Send + Sync {
    fn load(&self) -> Result<Vec<QueueEntry>, StorageError>;
    fn save(&self, entries: &[QueueEntry]) -> Result<(), StorageError>;
}

/// Single named file holding the queue. Writes go to a sibling temp file and are
/// renamed into place, so a crash leaves either the old or the new array.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(OFFLINE_QUEUE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, err: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}

impl OfflineQueueStore for FileQueueStore {
    fn load(&self) -> Result<Vec<QueueEntry>, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_err(err)),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|err| StorageError::Corrupt {
            path: self.path.display().to_string(),
            message: err.to_string(),
        })
    }

    fn save(&self, entries: &[QueueEntry]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }
        let payload = serde_json::to_vec_pretty(entries).map_err(|err| StorageError::Corrupt {
            path: self.path.display().to_string(),
            message: err.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| self.io_err(e))?;
        file.write_all(&payload).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    entries: Mutex<Vec<QueueEntry>>,
}

impl OfflineQueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<QueueEntry>, StorageError> {
        Ok(match self.entries.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        })
    }

    fn save(&self, entries: &[QueueEntry]) -> Result<(), StorageError> {
        let mut g = match self.entries.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *g = entries.to_vec();
        Ok(())
    }
}

/// FIFO offline queue with write-through persistence. Every mutation is saved before
/// it returns, so acknowledged removals and new entries survive a restart.
pub struct OfflineQueue<S: OfflineQueueStore> {
    store: S,
    entries: Vec<QueueEntry>,
}

impl<S: OfflineQueueStore> OfflineQueue<S> {
    pub fn open(store: S) -> Result<Self, StorageError> {
        let entries = store.load()?;
        if !entries.is_empty() {
            tracing::info!(entries = entries.len(), "offline queue restored");
        }
        Ok(Self { store, entries })
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: &LocalEventId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| &e.local_id == local_id)
    }

    pub fn append(&mut self, entry: QueueEntry) -> Result<(), StorageError> {
        if self.get(&entry.local_id).is_some() {
            return Err(StorageError::DuplicateKey {
                table: "offline_queue",
                key: entry.local_id.as_str().to_string(),
            });
        }
        self.entries.push(entry);
        if let Err(err) = self.persist() {
            self.entries.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Removes an entry after the ingestion boundary acknowledged it.
    pub fn remove_acked(&mut self, local_id: &LocalEventId) -> Result<QueueEntry, StorageError> {
        let Some(idx) = self.entries.iter().position(|e| &e.local_id == local_id) else {
            return Err(StorageError::NotFound {
                table: "offline_queue",
                key: local_id.as_str().to_string(),
            });
        };
        let entry = self.entries.remove(idx);
        if let Err(err) = self.persist() {
            self.entries.insert(idx, entry);
            return Err(err);
        }
        Ok(entry)
    }

    pub fn replace(&mut self, entry: QueueEntry) -> Result<(), StorageError> {
        let Some(slot) = self.entries.iter_mut().find(|e| e.local_id == entry.local_id) else {
            return Err(StorageError::NotFound {
                table: "offline_queue",
                key: entry.local_id.as_str().to_string(),
            });
        };
        *slot = entry;
        self.persist()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.store.save(&self.entries)
    }
}
