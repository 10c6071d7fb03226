use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::delivery::EndpointConfig;
use crate::location::LocationConfig;
use crate::media::MediaConfig;
use crate::queue::{QueueConfig, QueueError};
use crate::sync::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<QueueError> for ConfigError {
    fn from(e: QueueError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Encrypt queued rows with a key from `REPORT_QUEUE_KEY` (hex).
    pub seal_at_rest: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("report-queue.db"),
            seal_at_rest: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ReportingConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ReportingConfig = raw.parse()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;

        if self.sync.max_drafts_per_cycle == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_drafts_per_cycle must be > 0".into(),
            ));
        }
        if self.sync.delivery_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.delivery_timeout_ms must be > 0".into(),
            ));
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("sync.poll_interval_ms must be > 0".into()));
        }
        if self.media.max_image_bytes == 0 || self.media.max_video_bytes == 0 {
            return Err(ConfigError::Invalid("media size limits must be > 0".into()));
        }
        if self.location.timeout_ms == 0 {
            return Err(ConfigError::Invalid("location.timeout_ms must be > 0".into()));
        }
        if self.endpoint.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "endpoint.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level cannot be empty".into()));
        }
        Ok(())
    }
}

impl std::str::FromStr for ReportingConfig {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ReportingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.max_attempts, 10);
        assert_eq!(config.queue.base_backoff_ms, 1_000);
        assert_eq!(config.queue.max_backoff_ms, 300_000);
        assert_eq!(config.sync.max_drafts_per_cycle, 20);
        assert_eq!(config.sync.delivery_timeout_ms, 30_000);
        assert_eq!(config.media.max_image_bytes, 10 * 1024 * 1024);
        assert_eq!(config.media.max_video_bytes, 100 * 1024 * 1024);
        assert_eq!(config.location.timeout_ms, 10_000);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: ReportingConfig = r#"
            [queue]
            max_attempts = 3

            [endpoint]
            base_url = "https://hazards.example.org/v1"

            [logging]
            json = true
        "#
        .parse()
        .unwrap();

        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.base_backoff_ms, 1_000);
        assert_eq!(config.endpoint.base_url, "https://hazards.example.org/v1");
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn rejects_unusable_values() {
        let config: ReportingConfig = "[queue]\nmax_attempts = 0\n".parse().unwrap();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        let config: ReportingConfig = "[sync]\nmax_drafts_per_cycle = 0\n".parse().unwrap();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        assert_matches!(
            "[queue]\nmax_attempts = \"ten\"\n".parse::<ReportingConfig>(),
            Err(ConfigError::Parse(_))
        );
    }

    #[test]
    fn load_reads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\ndatabase_path = \"/tmp/reports.db\"\nseal_at_rest = true").unwrap();

        let config = ReportingConfig::load(file.path()).unwrap();
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/reports.db"));
        assert!(config.storage.seal_at_rest);

        assert_matches!(
            ReportingConfig::load(Path::new("/nonexistent/report-queue.toml")),
            Err(ConfigError::Read { .. })
        );
    }
}
