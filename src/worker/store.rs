//! Durable agent-group session storage.
//!
//! The worker persists `{sessions: {agentId → entry}}` so tab groups survive
//! a worker restart. Older snapshots stored the sessions as an array; both
//! shapes are accepted on load.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read session store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write session store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse session store {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize session store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One persisted agent-group binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub agent_id: String,
    pub agent_name: String,
    pub group_id: u32,
    pub color: String,
    #[serde(default)]
    pub tabs: Vec<u32>,
    pub status: String,
    pub last_activity: i64,
}

#[derive(Debug, Serialize)]
struct Snapshot<'a> {
    sessions: &'a HashMap<String, PersistedSession>,
}

#[derive(Debug, Deserialize)]
struct SnapshotOwned {
    #[serde(default)]
    sessions: SessionsShape,
}

/// Map shape is current; the array shape is accepted for older snapshots.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionsShape {
    Map(HashMap<String, PersistedSession>),
    List(Vec<PersistedSession>),
}

impl Default for SessionsShape {
    fn default() -> Self {
        Self::Map(HashMap::new())
    }
}

impl SessionsShape {
    fn into_map(self) -> HashMap<String, PersistedSession> {
        match self {
            Self::Map(map) => map,
            Self::List(list) => list
                .into_iter()
                .map(|entry| (entry.agent_id.clone(), entry))
                .collect(),
        }
    }
}

/// File-backed session store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the persisted sessions; a missing file is an empty store.
    pub fn load(&self) -> Result<HashMap<String, PersistedSession>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let snapshot: SnapshotOwned =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(snapshot.sessions.into_map())
    }

    /// Persist the full session map, replacing the previous snapshot.
    pub fn save(&self, sessions: &HashMap<String, PersistedSession>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&Snapshot { sessions })?;
        fs::write(&self.path, bytes).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(agent_id: &str) -> PersistedSession {
        PersistedSession {
            agent_id: agent_id.to_string(),
            agent_name: agent_id.to_string(),
            group_id: 12,
            color: "cyan".to_string(),
            tabs: vec![42, 43],
            status: "active".to_string(),
            last_activity: 1_708_700_000_000,
        }
    }

    #[test]
    fn test_store_roundtrip_map_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));

        let mut sessions = HashMap::new();
        sessions.insert("agent-a".to_string(), sample_session("agent-a"));
        store.save(&sessions).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded, sessions, "save/load must roundtrip the map shape");
    }

    #[test]
    fn test_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("absent.json"));
        assert!(store.load().expect("missing file loads").is_empty());
    }

    #[test]
    fn test_store_accepts_legacy_array_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let legacy = serde_json::json!({
            "sessions": [
                {
                    "agentId": "agent-a",
                    "agentName": "agent-a",
                    "groupId": 3,
                    "color": "red",
                    "tabs": [7],
                    "status": "active",
                    "lastActivity": 1_708_700_000_000i64,
                }
            ]
        });
        fs::write(&path, serde_json::to_vec(&legacy).unwrap()).expect("write legacy");

        let loaded = SessionStore::new(path).load().expect("load legacy");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["agent-a"].group_id, 3);
        assert_eq!(loaded["agent-a"].tabs, vec![7]);
    }

    #[test]
    fn test_store_rejects_unparseable_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        fs::write(&path, b"{not json").expect("write garbage");
        let err = SessionStore::new(path).load().expect_err("garbage must fail");
        assert!(matches!(err, StoreError::Parse { .. }));
    }
}
