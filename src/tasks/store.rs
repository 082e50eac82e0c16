use crate::tasks::types::{TaskResult, TaskTriggerInfo};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Durable per-worker storage for the last run result and the trigger
/// configuration, one JSON blob per worker id.
#[derive(Clone)]
pub struct TaskStore {
    results_dir: PathBuf,
    config_dir: PathBuf,
}

impl TaskStore {
    pub fn new(data_dir: PathBuf) -> Self {
        let root = data_dir.join("scheduled_tasks");
        Self {
            config_dir: root.join("config"),
            results_dir: root,
        }
    }

    pub fn load_result(&self, id: &str) -> Option<TaskResult> {
        read_json(&self.result_path(id))
    }

    pub fn save_result(&self, id: &str, result: &TaskResult) -> Result<()> {
        write_json(&self.result_path(id), result)
    }

    pub fn load_triggers(&self, id: &str) -> Option<Vec<TaskTriggerInfo>> {
        read_json(&self.config_path(id))
    }

    pub fn save_triggers(&self, id: &str, triggers: &[TaskTriggerInfo]) -> Result<()> {
        write_json(&self.config_path(id), &triggers)
    }

    fn result_path(&self, id: &str) -> PathBuf {
        self.results_dir.join(format!("{id}.json"))
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.config_dir.join(format!("{id}.json"))
    }
}

/// Missing, empty and unparseable blobs all read as `None`; only the latter
/// two are worth a warning.
fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    if content.trim().is_empty() {
        warn!("Ignoring empty file {}", path.display());
        return None;
    }
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring corrupt file {}: {}", path.display(), e);
            None
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
