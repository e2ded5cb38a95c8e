//! Snapshot storage.

use crate::error::PersistError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statech_event::SessionId;
use statech_interp::InstanceRecord;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// When the host captures a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotPolicy {
    /// Never automatically snapshot.
    Off,
    /// Snapshot at every macrostep boundary.
    PerMacrostep,
    /// Snapshot after every microstep as well. Costlier, stronger
    /// durability.
    PerMicrostep,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::PerMacrostep
    }
}

/// Snapshot metadata stored in the index, one entry per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub session_id: SessionId,
    pub chart_name: String,
    pub chart_checksum: String,
    pub status: String,
    pub created_at: i64,
    pub size_bytes: u64,
    pub checksum: String,
}

/// On-disk store of the latest record per session.
pub struct SnapshotStore {
    dir: PathBuf,
    index: RwLock<HashMap<SessionId, SnapshotMeta>>,
}

impl SnapshotStore {
    /// Opens or creates a snapshot store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            index: RwLock::new(HashMap::new()),
        };
        store.load_index()?;
        Ok(store)
    }

    fn load_index(&self) -> Result<(), PersistError> {
        let index_path = self.dir.join("index.json");
        if !index_path.exists() {
            return Ok(());
        }

        let file = File::open(&index_path)?;
        let reader = BufReader::new(file);
        let index: HashMap<SessionId, SnapshotMeta> = serde_json::from_reader(reader)?;
        *self.index.write() = index;
        Ok(())
    }

    fn save_index(&self) -> Result<(), PersistError> {
        let index_path = self.dir.join("index.json");
        let file = File::create(&index_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &*self.index.read())?;
        Ok(())
    }

    /// Writes a record, replacing any previous one for the session.
    pub fn save(&self, record: &InstanceRecord) -> Result<SnapshotMeta, PersistError> {
        let data = serde_json::to_vec_pretty(record)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));

        let path = self.record_path(&record.session_id);
        let mut file = File::create(&path)?;
        file.write_all(&data)?;
        file.sync_all()?;

        let meta = SnapshotMeta {
            session_id: record.session_id.clone(),
            chart_name: record.chart_name.clone(),
            chart_checksum: record.chart_checksum.clone(),
            status: record.status.clone(),
            created_at: record.captured_at,
            size_bytes: data.len() as u64,
            checksum,
        };

        {
            let mut index = self.index.write();
            index.insert(record.session_id.clone(), meta.clone());
        }
        self.save_index()?;

        tracing::debug!(
            session = %record.session_id,
            chart = %record.chart_name,
            bytes = meta.size_bytes,
            "snapshot saved"
        );
        Ok(meta)
    }

    /// Loads the record for a session, verifying its checksum first.
    pub fn load(&self, session_id: &SessionId) -> Result<InstanceRecord, PersistError> {
        let path = self.record_path(session_id);
        if !path.exists() {
            return Err(PersistError::NotFound(session_id.to_string()));
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        {
            let index = self.index.read();
            if let Some(meta) = index.get(session_id) {
                let actual = format!("{:08x}", crc32c::crc32c(&data));
                if actual != meta.checksum {
                    return Err(PersistError::Corruption(format!(
                        "snapshot for session {session_id} checksum mismatch"
                    )));
                }
            }
        }

        let record: InstanceRecord = serde_json::from_slice(&data)?;
        Ok(record)
    }

    pub fn meta(&self, session_id: &SessionId) -> Option<SnapshotMeta> {
        self.index.read().get(session_id).cloned()
    }

    /// All known snapshots, in no particular order.
    pub fn list(&self) -> Vec<SnapshotMeta> {
        self.index.read().values().cloned().collect()
    }

    /// Removes the record for a session. Missing records are fine.
    pub fn delete(&self, session_id: &SessionId) -> Result<(), PersistError> {
        let path = self.record_path(session_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        {
            let mut index = self.index.write();
            index.remove(session_id);
        }
        self.save_index()?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.index.read().len()
    }

    fn record_path(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.snap", session_id))
    }
}
