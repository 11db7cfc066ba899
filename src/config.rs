use crate::pipeline::PipelineSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "LOG_INGEST_CONFIG";
pub const ROOT_DIR_ENV: &str = "LOG_INGEST_DIR";
pub const DB_PATH_ENV: &str = "LOG_INGEST_DB";

const CURSOR_FILE_NAME: &str = "cursor_state.json";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    pub root_dir: String,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Where cursor state is kept (DEFAULT: `<root_dir>/cursor_state.json`)
    #[serde(default)]
    pub cursor_path: Option<String>,
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaderConfig {
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub db_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    #[serde(default = "default_events_enabled")]
    pub enabled: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENT_FILES: usize = 64;
const DEFAULT_MAX_LINE_BYTES: usize = crate::reader::DEFAULT_MAX_LINE_BYTES;
const DEFAULT_BATCH_SIZE: usize = crate::batch::DEFAULT_BATCH_SIZE;
const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUEUE_CAPACITY: usize = crate::events::DEFAULT_QUEUE_CAPACITY;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 3_600;

fn default_scan_interval_secs() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_max_concurrent_files() -> usize {
    DEFAULT_MAX_CONCURRENT_FILES
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_timeout_secs() -> u64 {
    DEFAULT_FLUSH_TIMEOUT_SECS
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_events_enabled() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Read and validate the TOML file at `path`, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        let mut config = Self::parse(&raw)?;
        config.apply_overrides(
            std::env::var(ROOT_DIR_ENV).ok(),
            std::env::var(DB_PATH_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid configuration")
    }

    pub fn apply_overrides(&mut self, root_dir: Option<String>, db_path: Option<String>) {
        if let Some(root_dir) = root_dir.filter(|s| !s.trim().is_empty()) {
            self.tracker.root_dir = root_dir;
        }
        if let Some(db_path) = db_path.filter(|s| !s.trim().is_empty()) {
            self.storage.db_path = db_path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker.root_dir.trim().is_empty() {
            anyhow::bail!("tracker.root_dir cannot be empty");
        }
        if self.storage.db_path.trim().is_empty() {
            anyhow::bail!("storage.db_path cannot be empty");
        }
        if self.tracker.scan_interval_secs == 0 {
            anyhow::bail!("tracker.scan_interval_secs must be at least 1");
        }
        if self.tracker.max_concurrent_files == 0 {
            anyhow::bail!("tracker.max_concurrent_files must be at least 1");
        }
        if self.reader.max_line_bytes == 0 {
            anyhow::bail!("reader.max_line_bytes must be at least 1");
        }
        if self.storage.batch_size == 0 {
            anyhow::bail!("storage.batch_size must be at least 1");
        }
        if self.storage.flush_timeout_secs == 0 {
            anyhow::bail!("storage.flush_timeout_secs must be at least 1");
        }
        if self.events.poll_interval_secs == 0 {
            anyhow::bail!("events.poll_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn root_dir(&self) -> PathBuf {
        expand(&self.tracker.root_dir)
    }

    pub fn cursor_path(&self) -> PathBuf {
        match &self.tracker.cursor_path {
            Some(path) if !path.trim().is_empty() => expand(path),
            _ => self.root_dir().join(CURSOR_FILE_NAME),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        expand(&self.storage.db_path)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.scan_interval_secs)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_secs(self.events.poll_interval_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    pub fn pipeline_settings(&self, batch_size: usize) -> PipelineSettings {
        PipelineSettings {
            max_line_bytes: self.reader.max_line_bytes,
            batch_size,
            flush_timeout: Duration::from_secs(self.storage.flush_timeout_secs),
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [tracker]
        root_dir = "/var/log/nginx"

        [storage]
        db_path = "/var/lib/ingest/logs.sqlite"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).expect("parse");
        config.validate().expect("valid");

        assert_eq!(config.scan_interval(), Duration::from_secs(60));
        assert_eq!(config.tracker.max_concurrent_files, 64);
        assert_eq!(config.reader.max_line_bytes, 4 * 1024 * 1024);
        assert_eq!(config.storage.batch_size, 1_000);
        assert_eq!(
            config.cursor_path(),
            PathBuf::from("/var/log/nginx/cursor_state.json")
        );
        assert!(config.events.enabled);
        assert_eq!(config.events.queue_capacity, 100);
        assert_eq!(config.event_poll_interval(), Duration::from_secs(3_600));
    }

    #[test]
    fn explicit_values_are_respected() {
        let config = Config::parse(
            r#"
            [tracker]
            root_dir = "/logs"
            scan_interval_secs = 5
            cursor_path = "/state/cursors.json"
            max_concurrent_files = 4

            [reader]
            max_line_bytes = 1024

            [storage]
            db_path = "/db.sqlite"
            batch_size = 50
            flush_timeout_secs = 10

            [events]
            enabled = false
            queue_capacity = 8
            "#,
        )
        .expect("parse");

        assert_eq!(config.cursor_path(), PathBuf::from("/state/cursors.json"));
        let settings = config.pipeline_settings(config.storage.batch_size);
        assert_eq!(settings.max_line_bytes, 1024);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.flush_timeout, Duration::from_secs(10));
        assert!(!config.events.enabled);
    }

    #[test]
    fn overrides_replace_paths() {
        let mut config = Config::parse(MINIMAL).expect("parse");
        config.apply_overrides(Some("/other".into()), Some("".into()));

        assert_eq!(config.root_dir(), PathBuf::from("/other"));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/ingest/logs.sqlite"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = Config::parse(MINIMAL).expect("parse");
        config.storage.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_section_is_an_error() {
        assert!(Config::parse("[tracker]\nroot_dir = \"/x\"\n").is_err());
    }
}
