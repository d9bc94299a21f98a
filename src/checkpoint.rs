// checkpoint.rs - Resume file for the summarization pipeline
//
// The whole store is one JSON document:
//   { "groups": { "<group id>": { "<stage key>": <payload>, ... } } }
//
// Stage payloads are kept as raw JSON values so keys written by other versions
// of the tool survive a load -> mutate -> save cycle untouched, as do unknown
// top-level keys.

use crate::error::{DigestError, DigestResult};
use crate::observe::Observer;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Completed stages of one group: stage key -> stage output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupProgress {
    stages: BTreeMap<String, Value>,
}

impl GroupProgress {
    pub fn contains(&self, stage_key: &str) -> bool {
        self.stages.contains_key(stage_key)
    }

    pub fn get(&self, stage_key: &str) -> Option<&Value> {
        self.stages.get(stage_key)
    }

    pub fn insert(&mut self, stage_key: &str, payload: Value) {
        self.stages.insert(stage_key.to_string(), payload);
    }

    pub fn remove(&mut self, stage_key: &str) -> Option<Value> {
        self.stages.remove(stage_key)
    }

    pub fn stage_keys(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStore {
    #[serde(default)]
    groups: BTreeMap<String, GroupProgress>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl CheckpointStore {
    /// Loads the store from `path`. A missing path, a missing file or an
    /// unreadable document all give an empty store.
    pub fn load(path: Option<&Path>, observer: &Observer) -> Self {
        let target = observer.target();
        let Some(path) = path else {
            return Self::default();
        };

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(target: target, "📂 No resume file at {}, starting fresh", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!(target: target, "⚠️ Cannot read resume file {}: {}. Starting fresh", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<CheckpointStore>(&content) {
            Ok(store) => {
                info!(
                    target: target,
                    "📂 Loaded resume file {} with {} pending group(s)",
                    path.display(),
                    store.groups.len()
                );
                store
            }
            Err(e) => {
                warn!(target: target, "⚠️ Resume file {} is corrupt: {}. Starting fresh", path.display(), e);
                Self::default()
            }
        }
    }

    /// Writes the whole document to a sibling temp file and renames it over
    /// `path`, so a crash mid-write leaves the previous version intact.
    pub fn save(&self, path: Option<&Path>) -> DigestResult<()> {
        let Some(path) = path else {
            return Ok(());
        };
        let io_err = |source| DigestError::Checkpoint {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_string_pretty(self)?;
        let temp_path = temp_sibling(path);

        let write_result = (|| {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, path)
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(io_err(e));
        }
        Ok(())
    }

    /// Removes the persisted document; a missing path or file is not an error.
    pub fn delete(path: Option<&Path>) -> DigestResult<()> {
        let Some(path) = path else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DigestError::Checkpoint {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupProgress> {
        self.groups.get(group_id)
    }

    pub fn group_mut(&mut self, group_id: &str) -> &mut GroupProgress {
        self.groups.entry(group_id.to_string()).or_default()
    }

    pub fn clear_group(&mut self, group_id: &str) -> Option<GroupProgress> {
        self.groups.remove(group_id)
    }

    pub fn pending_groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "resume.json".to_string());
    path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("group_digest_resume_{}.json", Uuid::new_v4()))
    }

    #[test]
    fn test_unset_path_is_noop() {
        let observer = Observer::default();
        assert!(CheckpointStore::load(None, &observer).is_empty());
        assert!(CheckpointStore::default().save(None).is_ok());
        assert!(CheckpointStore::delete(None).is_ok());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let path = temp_path();
        let store = CheckpointStore::load(Some(path.as_path()), &Observer::default());
        assert!(store.is_empty());
        assert!(CheckpointStore::delete(Some(path.as_path())).is_ok());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let path = temp_path();
        fs::write(&path, "{ not json").unwrap();
        let store = CheckpointStore::load(Some(path.as_path()), &Observer::default());
        let _ = fs::remove_file(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let path = temp_path();
        let mut store = CheckpointStore::default();
        store
            .group_mut("group-a")
            .insert("attachment_descriptions", json!({"17": ["A dog on a beach."]}));
        store
            .group_mut("group-a")
            .insert("theme_clusters", json!({"clusters": [[0, 2], [1, 3]]}));
        store.group_mut("group-b").insert("final_summary", json!({"text": "Done."}));

        store.save(Some(path.as_path())).unwrap();
        let loaded = CheckpointStore::load(Some(path.as_path()), &Observer::default());
        CheckpointStore::delete(Some(path.as_path())).unwrap();

        assert_eq!(loaded, store);
        assert!(!path.exists());
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let path = temp_path();
        fs::write(
            &path,
            r#"{"groups":{"g1":{"merged_messages":{"messages":[],"themes":[]},"poll_results":{"4":"hello"}}},"version":2}"#,
        )
        .unwrap();

        let mut store = CheckpointStore::load(Some(path.as_path()), &Observer::default());
        store.group_mut("g1").insert("theme_clusters", json!({"clusters": []}));
        store.save(Some(path.as_path())).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(raw["groups"]["g1"]["poll_results"]["4"], "hello");
        assert_eq!(raw["groups"]["g1"]["theme_clusters"]["clusters"], json!([]));
        assert_eq!(raw["version"], 2);
    }

    #[test]
    fn test_legacy_document_without_groups_key() {
        let path = temp_path();
        fs::write(&path, "{}").unwrap();
        let store = CheckpointStore::load(Some(path.as_path()), &Observer::default());
        let _ = fs::remove_file(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_group() {
        let mut store = CheckpointStore::default();
        store.group_mut("g1").insert("merged_messages", json!({}));
        assert_eq!(store.pending_groups().collect::<Vec<_>>(), vec!["g1"]);
        assert!(store.clear_group("g1").is_some());
        assert!(store.is_empty());
    }
}
