//! Opaque load/save interface for the broker's vhost configuration.
//!
//! Configuration lives in one JSON file per node inside the storage
//! directory. Runtime state (subscribers, workers, queued payloads) is never
//! persisted; durability is out of scope for the broker.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Persisted shape of a single vhost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhostRecord {
    pub path: String,
    pub access_token: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Storage {
    file: PathBuf,
}

impl Storage {
    pub fn new(dir: &Path, node_name: &str) -> Self {
        Self {
            file: dir.join(format!("{node_name}.vhosts.json")),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Loads the stored records; a missing file is an empty configuration.
    pub fn load(&self) -> Result<Vec<VhostRecord>, StorageError> {
        let raw = match fs::read(&self.file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Atomically replaces the stored records.
    pub fn save(&self, records: &[VhostRecord]) -> Result<(), StorageError> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = self.file.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&staged, &self.file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("webrocket-storage-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = scratch_dir();
        let storage = Storage::new(&dir, "node");
        assert!(storage.load().unwrap().is_empty());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn records_round_trip() {
        let dir = scratch_dir();
        let storage = Storage::new(&dir, "node");
        let records = vec![VhostRecord {
            path: "/demo".into(),
            access_token: "t".repeat(40),
            channels: vec!["room".into(), "presence-lobby".into()],
        }];
        storage.save(&records).unwrap();
        assert_eq!(storage.load().unwrap(), records);
        fs::remove_dir_all(dir).unwrap();
    }
}
