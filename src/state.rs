use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Named integer offsets for one stage (e.g. `entry_index`, `row_index`).
/// A missing field means "not started".
pub type Cursor = BTreeMap<String, u64>;

pub fn offset(cursor: &Cursor, field: &str) -> usize {
    cursor.get(field).copied().unwrap_or(0) as usize
}

/// JSON-backed progress store: stage name → cursor, rewritten atomically
/// (write to `state.tmp`, then rename over `state.json`) on every update.
/// A crash mid-write leaves the previous file intact.
pub struct StateManager {
    path: PathBuf,
    data: Mutex<BTreeMap<String, Cursor>>,
}

impl StateManager {
    /// Opens the store at `path`. A missing or unreadable file starts fresh
    /// with a warning; it never fails.
    pub fn new(path: PathBuf) -> Self {
        let data = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Failed to parse state file {}: {}", path.display(), err);
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file {} does not exist, starting fresh", path.display());
                BTreeMap::new()
            }
            Err(err) => {
                warn!("Failed to read state file {}: {}", path.display(), err);
                BTreeMap::new()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    /// Last-known cursor for `stage`, empty if unseen.
    pub fn stage(&self, stage: &str) -> Cursor {
        let data = self.data.lock().unwrap();
        data.get(stage).cloned().unwrap_or_default()
    }

    /// Merges `fields` into the stage's cursor and persists the whole store.
    pub fn update(&self, stage: &str, fields: &[(&str, u64)]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let cursor = data.entry(stage.to_string()).or_default();
        for (field, value) in fields {
            cursor.insert((*field).to_string(), *value);
        }
        self.flush(&data)
    }

    /// Removes the stage's cursor entirely (forced re-run).
    pub fn reset(&self, stage: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.remove(stage).is_some() {
            self.flush(&data)?;
        }
        Ok(())
    }

    fn flush(&self, data: &BTreeMap<String, Cursor>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(data)?;
        fs::write(&tmp, body)
            .with_context(|| format!("failed to write state to {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace state file {}", self.path.display()))?;
        debug!("State written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    #[test]
    fn fresh_store_returns_empty_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(state_path(&dir));
        let cursor = state.stage("stage1");
        assert!(cursor.is_empty());
        assert_eq!(offset(&cursor, "entry_index"), 0);
    }

    #[test]
    fn update_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = StateManager::new(state_path(&dir));
            state.update("stage1", &[("entry_index", 3)]).unwrap();
        }
        let state = StateManager::new(state_path(&dir));
        assert_eq!(offset(&state.stage("stage1"), "entry_index"), 3);
    }

    #[test]
    fn update_merges_fields_into_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(state_path(&dir));
        state.update("stage1", &[("entry_index", 1)]).unwrap();
        state.update("stage1", &[("block_index", 4)]).unwrap();
        let cursor = state.stage("stage1");
        assert_eq!(offset(&cursor, "entry_index"), 1);
        assert_eq!(offset(&cursor, "block_index"), 4);
    }

    #[test]
    fn update_preserves_other_stages() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(state_path(&dir));
        state.update("stage1", &[("entry_index", 2)]).unwrap();
        state.update("stage2", &[("row_index", 7)]).unwrap();
        assert_eq!(offset(&state.stage("stage1"), "entry_index"), 2);
        assert_eq!(offset(&state.stage("stage2"), "row_index"), 7);
    }

    #[test]
    fn reset_removes_stage_only() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(state_path(&dir));
        state.update("stage1", &[("entry_index", 2)]).unwrap();
        state.update("stage2", &[("row_index", 7)]).unwrap();
        state.reset("stage1").unwrap();

        let state = StateManager::new(state_path(&dir));
        assert!(state.stage("stage1").is_empty());
        assert_eq!(offset(&state.stage("stage2"), "row_index"), 7);
    }

    #[test]
    fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        fs::write(&path, "not json {{{").unwrap();
        let state = StateManager::new(path.clone());
        assert!(state.stage("stage1").is_empty());
        state.update("stage1", &[("entry_index", 1)]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("entry_index"));
    }

    #[test]
    fn no_temp_file_left_after_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        let state = StateManager::new(path.clone());
        state.update("stage3", &[("row_index", 9)]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
