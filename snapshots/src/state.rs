use crate::{Error, Info, Kind, Labels};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{rename, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// `SnapshotMetadata` struct holds information's about a snapshot in the state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub(crate) struct SnapshotMetadata {
    /// The id of the snapshot, naming its directory
    pub id: String,
    pub kind: Kind,
    /// The name of the committed parent
    pub parent: Option<String>,
    pub labels: Labels,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Disk usage recorded at commit time
    pub size: i64,
    pub inodes: i64,
}

impl SnapshotMetadata {
    pub fn new(id: String, kind: Kind, parent: Option<String>, labels: Labels) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            kind,
            parent,
            labels,
            created_at: now,
            updated_at: now,
            size: 0,
            inodes: 0,
        }
    }

    pub fn info(&self, name: &str) -> Info {
        Info {
            name: name.to_string(),
            parent: self.parent.clone(),
            kind: self.kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
            labels: self.labels.clone(),
        }
    }
}

/// `State` is responsible about storing information's about snapshots, indexed
/// by key for active and view snapshots and by name for committed ones.
#[derive(Clone, Default, Deserialize, Debug, Serialize, PartialEq)]
pub(crate) struct State {
    snapshots: HashMap<String, SnapshotMetadata>,
    /// An index to track the last snapshot identifier
    index: usize,
}

impl State {
    /// Save the state into the file.
    ///
    /// The state is written next to `path` first and renamed over it, so that
    /// the file always holds a complete state.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let serialized = serde_json::to_string_pretty(&self)
            .map_err(|e| Error::SerializeState(e.to_string()))?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| Error::OpenStateFile(e.to_string()))?;
        file.write_all(serialized.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| Error::WriteStateFile(e.to_string()))?;

        rename(&tmp, path).map_err(|e| Error::WriteStateFile(e.to_string()))
    }

    pub fn add_snapshot(&mut self, key: &str, snapshot: SnapshotMetadata) -> &mut Self {
        self.snapshots.insert(key.to_string(), snapshot);
        self
    }

    pub fn remove_snapshot(&mut self, key: &str) -> Option<SnapshotMetadata> {
        self.snapshots.remove(key)
    }

    pub fn has_snapshot(&self, key: &str) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn snapshot(&self, key: &str) -> Option<&SnapshotMetadata> {
        self.snapshots.get(key)
    }

    pub fn snapshot_mut(&mut self, key: &str) -> Option<&mut SnapshotMetadata> {
        self.snapshots.get_mut(key)
    }

    /// Check if a snapshot is the parent of another one.
    pub fn has_children(&self, key: &str) -> bool {
        self.snapshots
            .values()
            .any(|s| s.parent.as_deref() == Some(key))
    }

    /// Snapshots sorted by key.
    pub fn snapshots(&self) -> Vec<(&String, &SnapshotMetadata)> {
        let mut snapshots = self.snapshots.iter().collect::<Vec<_>>();
        snapshots.sort_by(|a, b| a.0.cmp(b.0));
        snapshots
    }

    /// Get a new snapshot index
    pub fn snapshot_index(&mut self) -> usize {
        self.index += 1;
        self.index
    }
}

impl TryFrom<&PathBuf> for State {
    type Error = crate::Error;

    /// Load the state from `state_file`. A missing or empty file is a new store,
    /// anything else must hold a valid state.
    fn try_from(state_file: &PathBuf) -> Result<Self, Self::Error> {
        let mut content = String::new();
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(state_file)
            .and_then(|mut file| file.read_to_string(&mut content))
            .map_err(|e| Error::OpenStateFile(e.to_string()))?;

        if content.trim().is_empty() {
            return Ok(State::default());
        }

        serde_json::from_str(&content)
            .map_err(|e| Error::ParseStateFile(format!("{}: {}", state_file.display(), e)))
    }
}
