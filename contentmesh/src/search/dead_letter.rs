use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::event::MutationEvent;
use crate::search::IndexTarget;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// An event whose obligations kept failing after every retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: Uuid,
    pub event: MutationEvent,
    /// Targets that were not synchronized. Empty when the event could not be
    /// resolved at all.
    pub failed_targets: Vec<IndexTarget>,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: MutationEvent, failed_targets: Vec<IndexTarget>, error: &str, attempts: u32) -> Self {
        DeadLetter {
            id: Uuid::new_v4(),
            event,
            failed_targets,
            error: error.to_string(),
            attempts,
            timestamp: Utc::now(),
        }
    }
}

enum Journal {
    InMemory,
    File(PathBuf),
}

/// Operator-visible log of dead-lettered events.
///
/// The file variant keeps one JSON document per line and survives restarts;
/// opening an existing journal loads its entries.
#[derive(Clone)]
pub struct DeadLetterLog {
    inner: Arc<DeadLetterLogInner>,
}

struct DeadLetterLogInner {
    journal: Journal,
    entries: Mutex<Vec<DeadLetter>>,
}

impl Default for DeadLetterLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DeadLetterLog {
    pub fn in_memory() -> Self {
        DeadLetterLog {
            inner: Arc::new(DeadLetterLogInner {
                journal: Journal::InMemory,
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens the journal at `path`, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: DeadLetter = serde_json::from_str(&line).map_err(|e| {
                    MeshError::new(
                        &format!("Corrupt dead letter journal {} at line {}: {}", path.display(), number + 1, e),
                        ErrorKind::EncodingError,
                    )
                })?;
                entries.push(entry);
            }
            log::info!("Loaded {} dead letters from {}", entries.len(), path.display());
        } else {
            File::create(&path)?;
        }

        Ok(DeadLetterLog {
            inner: Arc::new(DeadLetterLogInner {
                journal: Journal::File(path),
                entries: Mutex::new(entries),
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.inner.journal {
            Journal::InMemory => None,
            Journal::File(path) => Some(path),
        }
    }

    pub fn append(&self, entry: DeadLetter) -> MeshResult<()> {
        let mut entries = self.inner.entries.lock();
        if let Journal::File(path) = &self.inner.journal {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &entry)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.inner.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Removes the entry with the given id. The journal is rewritten
    /// before the entry leaves memory; returns false for an unknown id.
    pub fn remove(&self, id: &Uuid) -> MeshResult<bool> {
        let mut entries = self.inner.entries.lock();
        let Some(position) = entries.iter().position(|e| e.id == *id) else {
            return Ok(false);
        };
        let mut remaining = entries.clone();
        remaining.remove(position);
        self.persist(&remaining)?;
        *entries = remaining;
        Ok(true)
    }

    /// Replaces the entry with the given id by `entry` in one journal write.
    /// An unknown id appends `entry`.
    pub fn replace(&self, id: &Uuid, entry: DeadLetter) -> MeshResult<()> {
        let mut entries = self.inner.entries.lock();
        let mut updated = entries.clone();
        match updated.iter().position(|e| e.id == *id) {
            Some(position) => updated[position] = entry,
            None => updated.push(entry),
        }
        self.persist(&updated)?;
        *entries = updated;
        Ok(())
    }

    fn persist(&self, entries: &[DeadLetter]) -> MeshResult<()> {
        match &self.inner.journal {
            Journal::InMemory => Ok(()),
            Journal::File(path) => rewrite_journal(path, entries),
        }
    }
}

// the journal is replaced by a rename so a crash leaves either version
fn rewrite_journal(path: &Path, entries: &[DeadLetter]) -> MeshResult<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    {
        let mut writer = BufWriter::new(File::create(&staging)?);
        for entry in entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    std::fs::rename(&staging, path)?;
    Ok(())
}
