use crate::dlna::{DeviceProperties, DeviceSettings};
use crate::tasks::WorkerSettings;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "mediahost";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub cache_retention_days: u32,
    pub log_retention_days: u32,
    pub tasks: TasksConfig,
    pub dlna: DlnaConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub trigger_settle_ms: u64,
    pub dispose_wait_ms: u64,
    pub startup_delay_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DlnaConfig {
    /// Address renderers post events to; subscriptions are skipped when empty.
    pub callback_url: String,
    pub devices: Vec<DeviceProperties>,
    pub request_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub immediate_refresh_ms: u64,
    pub refresh_throttle_secs: u64,
    pub subscription_timeout_secs: u64,
    pub failure_threshold: u32,
    pub dispatch_idle_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let cache_dir = dirs::cache_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| data_dir.join("cache"));
        Self {
            log_dir: data_dir.join("log"),
            cache_dir,
            data_dir,
            cache_retention_days: 30,
            log_retention_days: 7,
            tasks: TasksConfig::default(),
            dlna: DlnaConfig::default(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            trigger_settle_ms: 1000,
            dispose_wait_ms: 2000,
            startup_delay_ms: 3000,
        }
    }
}

impl Default for DlnaConfig {
    fn default() -> Self {
        Self {
            callback_url: String::new(),
            devices: Vec::new(),
            request_timeout_secs: 10,
            poll_interval_ms: 1000,
            immediate_refresh_ms: 100,
            refresh_throttle_secs: 5,
            subscription_timeout_secs: 1800,
            failure_threshold: 3,
            dispatch_idle_ms: 100,
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MEDIAHOST_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.json")
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::load_from(&config_path())?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("failed to parse config at {}: {e}", path.display()))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = set("MEDIAHOST_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = set("MEDIAHOST_CALLBACK_URL") {
            self.dlna.callback_url = url;
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            trigger_settle: Duration::from_millis(self.tasks.trigger_settle_ms),
            dispose_wait: Duration::from_millis(self.tasks.dispose_wait_ms),
            startup_delay: Duration::from_millis(self.tasks.startup_delay_ms),
        }
    }

    pub fn device_settings(&self) -> DeviceSettings {
        let dlna = &self.dlna;
        DeviceSettings {
            callback_url: dlna.callback_url.clone(),
            poll_interval: Duration::from_millis(dlna.poll_interval_ms),
            immediate_refresh: Duration::from_millis(dlna.immediate_refresh_ms),
            refresh_throttle: Duration::from_secs(dlna.refresh_throttle_secs),
            subscription_timeout: Duration::from_secs(dlna.subscription_timeout_secs),
            failure_threshold: dlna.failure_threshold.max(1),
            dispatch_idle: Duration::from_millis(dlna.dispatch_idle_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dlna.request_timeout_secs)
    }
}
