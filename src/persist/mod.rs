// State Persistence
//
// Optional JSON snapshots of admin state. Every mutation rewrites the whole
// file atomically (temp file + rename). Saves are best-effort: failures are
// logged and never fatal. Corrupted files produce a warning and an empty
// start; missing files start empty.

use crate::keys::groups::KeyGroup;
use crate::keys::store::ApiKeyRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const KEYS_FILE: &str = "keys.json";
const GROUPS_FILE: &str = "groups.json";
const ADMIN_KEY_FILE: &str = "admin_key";

/// Persisted group state layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupsSnapshot {
    #[serde(default)]
    pub groups: Vec<KeyGroup>,
    #[serde(default)]
    pub assignments: Vec<(String, String)>,
}

pub struct StateFile {
    dir: PathBuf,
}

impl StateFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Key records as an array of `[key, record]` tuples. Unknown fields in
    /// stored records are ignored; missing ones back-fill serde defaults.
    pub fn load_keys(&self) -> Vec<(String, ApiKeyRecord)> {
        self.load_json(KEYS_FILE).unwrap_or_default()
    }

    pub fn save_keys(&self, records: &[(String, ApiKeyRecord)]) {
        self.save_json(KEYS_FILE, &records);
    }

    pub fn load_groups(&self) -> GroupsSnapshot {
        self.load_json(GROUPS_FILE).unwrap_or_default()
    }

    pub fn save_groups(&self, snapshot: &GroupsSnapshot) {
        self.save_json(GROUPS_FILE, snapshot);
    }

    /// Admin key persists across restarts so the printed key stays valid.
    pub fn load_admin_key(&self) -> Option<String> {
        let path = self.dir.join(ADMIN_KEY_FILE);
        match fs::read_to_string(&path) {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    pub fn save_admin_key(&self, key: &str) {
        if let Err(e) = self.write_atomic(ADMIN_KEY_FILE, key.as_bytes()) {
            log::warn!("failed to persist admin key: {}", e);
        }
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, file: &str) -> Option<T> {
        let path = self.dir.join(file);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("corrupt state file {}, starting empty: {}", path.display(), e);
                None
            }
        }
    }

    fn save_json<T: Serialize>(&self, file: &str, value: &T) {
        let payload = match serde_json::to_vec_pretty(value) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("failed to serialize {}: {}", file, e);
                return;
            }
        };
        if let Err(e) = self.write_atomic(file, &payload) {
            log::warn!("failed to persist {}: {}", file, e);
        }
    }

    // Write to a sibling temp file, then rename over the target.
    fn write_atomic(&self, file: &str, payload: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(file);
        let tmp = self.dir.join(format!("{}.tmp", file));
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::store::{CreateKeyOptions, KeyStore, KeyStoreConfig};
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn state() -> (StateFile, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (StateFile::new(dir.path()), dir)
    }

    #[test]
    fn test_missing_files_start_empty() {
        let (state, _dir) = state();
        assert!(state.load_keys().is_empty());
        assert!(state.load_groups().groups.is_empty());
        assert!(state.load_admin_key().is_none());
    }

    #[test]
    fn test_keys_round_trip() {
        let (state, _dir) = state();
        let store = KeyStore::new(KeyStoreConfig::default(), ManualClock::shared(1_000));
        let record = store.create_key("a", 42, CreateKeyOptions::default());

        state.save_keys(&[(record.key.clone(), record.clone())]);
        let loaded = state.load_keys();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, record.key);
        assert_eq!(loaded[0].1.credits, 42);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let (state, dir) = state();
        std::fs::write(dir.path().join("keys.json"), b"{not json").unwrap();
        assert!(state.load_keys().is_empty());
    }

    #[test]
    fn test_missing_record_fields_backfill() {
        let (state, dir) = state();
        // A minimal stored record; everything else takes serde defaults.
        let raw = r#"[["tg_x", {"key": "tg_x", "name": "old", "credits": 7, "created_at": 1}]]"#;
        std::fs::write(dir.path().join("keys.json"), raw).unwrap();

        let loaded = state.load_keys();
        assert_eq!(loaded.len(), 1);
        let record = &loaded[0].1;
        assert!(record.active);
        assert_eq!(record.total_spent, 0);
        assert!(record.allowed_tools.is_empty());
    }

    #[test]
    fn test_admin_key_round_trip() {
        let (state, _dir) = state();
        state.save_admin_key("tg_admin_abc");
        assert_eq!(state.load_admin_key().as_deref(), Some("tg_admin_abc"));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let (state, dir) = state();
        state.save_keys(&[]);
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"keys.json".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".tmp")));
    }

    #[test]
    fn test_store_persists_on_mutation() {
        let (state, _dir) = state();
        let state = Arc::new(state);
        let store = KeyStore::new(KeyStoreConfig::default(), ManualClock::shared(1_000))
            .with_persistence(state.clone());
        let record = store.create_key("a", 10, CreateKeyOptions::default());
        store.deduct_credits(&record.key, 4);

        let loaded = state.load_keys();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.credits, 6);
    }
}
