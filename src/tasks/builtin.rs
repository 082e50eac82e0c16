//! Maintenance tasks registered by default.

use crate::config::AppConfig;
use crate::error::TaskError;
use crate::tasks::types::TaskTriggerInfo;
use crate::tasks::worker::{ProgressSink, ScheduledTask};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DAY: Duration = Duration::from_secs(24 * 3600);

pub fn default_tasks(cfg: &AppConfig) -> Vec<Arc<dyn ScheduledTask>> {
    vec![
        Arc::new(DeleteCacheFilesTask::new(
            cfg.cache_dir.clone(),
            DAY * cfg.cache_retention_days,
        )),
        Arc::new(DeleteLogFilesTask::new(
            cfg.log_dir.clone(),
            DAY * cfg.log_retention_days,
        )),
    ]
}

/// Deletes cached files not modified within the retention window.
pub struct DeleteCacheFilesTask {
    dir: PathBuf,
    retention: Duration,
}

impl DeleteCacheFilesTask {
    pub fn new(dir: PathBuf, retention: Duration) -> Self {
        Self { dir, retention }
    }
}

#[async_trait]
impl ScheduledTask for DeleteCacheFilesTask {
    fn key(&self) -> &str {
        "DeleteCacheFiles"
    }

    fn name(&self) -> &str {
        "Clean Cache Directory"
    }

    fn category(&self) -> &str {
        "Maintenance"
    }

    fn description(&self) -> &str {
        "Deletes cache files no longer needed by the system."
    }

    fn default_triggers(&self) -> Vec<TaskTriggerInfo> {
        vec![TaskTriggerInfo::interval(DAY)]
    }

    async fn execute(&self, progress: ProgressSink, cancel: CancellationToken) -> Result<()> {
        delete_older_than(&self.dir, self.retention, &progress, &cancel).await
    }
}

/// Deletes log files not modified within the retention window.
pub struct DeleteLogFilesTask {
    dir: PathBuf,
    retention: Duration,
}

impl DeleteLogFilesTask {
    pub fn new(dir: PathBuf, retention: Duration) -> Self {
        Self { dir, retention }
    }
}

#[async_trait]
impl ScheduledTask for DeleteLogFilesTask {
    fn key(&self) -> &str {
        "CleanLogFiles"
    }

    fn name(&self) -> &str {
        "Clean Log Directory"
    }

    fn category(&self) -> &str {
        "Maintenance"
    }

    fn description(&self) -> &str {
        "Deletes log files that are older than the retention period."
    }

    fn default_triggers(&self) -> Vec<TaskTriggerInfo> {
        vec![TaskTriggerInfo::startup(), TaskTriggerInfo::interval(DAY)]
    }

    async fn execute(&self, progress: ProgressSink, cancel: CancellationToken) -> Result<()> {
        delete_older_than(&self.dir, self.retention, &progress, &cancel).await
    }
}

async fn delete_older_than(
    dir: &Path,
    retention: Duration,
    progress: &ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let root = dir.to_path_buf();
    let stale = tokio::task::spawn_blocking(move || collect_stale(&root, cutoff))
        .await
        .context("file scan panicked")??;

    if stale.is_empty() {
        progress.report(100.0);
        return Ok(());
    }

    let total = stale.len();
    for (i, path) in stale.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled.into());
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Deleted {}", path.display()),
            Err(e) => warn!("Unable to delete {}: {}", path.display(), e),
        }
        progress.report((i + 1) as f64 / total as f64 * 100.0);
    }
    Ok(())
}

/// Files under `root` last modified before `cutoff`. A missing root has no
/// files.
fn collect_stale(root: &Path, cutoff: SystemTime) -> Result<Vec<PathBuf>> {
    let mut stale = Vec::new();
    if !root.exists() {
        return Ok(stale);
    }
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                dirs.push(entry.path());
            } else if meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                stale.push(entry.path());
            }
        }
    }
    stale.sort();
    Ok(stale)
}
