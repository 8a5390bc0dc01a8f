//! ---
//! keel_section: "07-resilience-fault-tolerance"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "JSON persistence for operator-registered replicas."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use keel_common::BackendConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FailoverError;

#[derive(Debug, Serialize, Deserialize)]
struct ReplicaDocument {
    resource: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    replicas: IndexMap<String, BackendConfig>,
}

/// Dynamic replica set persisted to a JSON file. Without a path nothing is persisted.
#[derive(Debug, Clone)]
pub struct ReplicaStore {
    resource: String,
    path: Option<PathBuf>,
}

impl ReplicaStore {
    pub fn new(resource: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            resource: resource.into(),
            path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<IndexMap<String, BackendConfig>, FailoverError> {
        let Some(path) = &self.path else {
            return Ok(IndexMap::new());
        };
        if !path.exists() {
            return Ok(IndexMap::new());
        }
        let load_err = |source: io::Error| FailoverError::Load {
            path: path.clone(),
            source,
        };
        let raw = fs::read_to_string(path).map_err(load_err)?;
        let document: ReplicaDocument =
            serde_json::from_str(&raw).map_err(|err| load_err(err.into()))?;
        debug!(resource = %self.resource, replicas = document.replicas.len(), "replica state loaded");
        Ok(document.replicas)
    }

    /// Write through a sibling temp file and rename so readers never see a partial document.
    pub fn save(&self, replicas: &IndexMap<String, BackendConfig>) -> Result<(), FailoverError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let persist_err = |source: io::Error| FailoverError::Persist {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        let document = ReplicaDocument {
            resource: self.resource.clone(),
            updated_at: Utc::now(),
            replicas: replicas.clone(),
        };
        let encoded =
            serde_json::to_vec_pretty(&document).map_err(|err| persist_err(err.into()))?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, encoded).map_err(persist_err)?;
        fs::rename(&tmp, path).map_err(persist_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn missing_path_is_a_noop() {
        let store = ReplicaStore::new("db", None);
        assert!(store.load().unwrap().is_empty());
        store.save(&IndexMap::new()).unwrap();
    }

    #[test]
    fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("db.json");
        let store = ReplicaStore::new("db", Some(path.clone()));
        let mut replicas = IndexMap::new();
        replicas.insert(
            "replica-b".to_string(),
            BackendConfig {
                priority: 7,
                lag_threshold: Some(Duration::from_millis(250)),
                ..BackendConfig::default()
            },
        );
        store.save(&replicas).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("state").join("db.json.tmp").exists());
        assert_eq!(store.load().unwrap(), replicas);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = ReplicaStore::new("db", Some(path));
        assert!(matches!(store.load(), Err(FailoverError::Load { .. })));
    }
}
