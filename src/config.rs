//! TOML configuration for the telemetry pipeline.
//!
//! Every section carries `#[serde(default)]`, so a partial file only overrides
//! what it names. Configuration is read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TELEMETRY_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/telemetry-pipeline/config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the pipeline process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: EventLogConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. An explicit path (CLI flag). Failing to load it is an error.
    /// 2. The path named by `TELEMETRY_CONFIG`.
    /// 3. `/etc/telemetry-pipeline/config.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TELEMETRY_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Where a consumer group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Location of the event log database.
    pub endpoint: PathBuf,
    pub topic: String,
    pub consumer_group: String,
    pub auto_offset_reset: OffsetReset,
    /// How long an empty poll waits before returning.
    pub poll_interval_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            endpoint: PathBuf::from("data/events.db"),
            topic: "events".to_string(),
            consumer_group: "event_processor".to_string(),
            auto_offset_reset: OffsetReset::Latest,
            poll_interval_ms: 500,
        }
    }
}

impl EventLogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub running: RunningThresholds,
    #[serde(default)]
    pub music: MusicThresholds,
}

/// Distance in metres, duration in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunningThresholds {
    pub max_distance: f64,
    pub min_duration: f64,
}

impl Default for RunningThresholds {
    fn default() -> Self {
        Self {
            max_distance: 42_000.0,
            min_duration: 300.0,
        }
    }
}

/// Song duration bounds in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicThresholds {
    pub max_duration: f64,
    pub min_duration: f64,
}

impl Default for MusicThresholds {
    fn default() -> Self {
        Self {
            max_duration: 600.0,
            min_duration: 30.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Consumption is paused briefly once either limit is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub max_messages: u64,
    pub max_elapsed_secs: u64,
    pub pause_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_elapsed_secs: 300,
            pause_ms: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Reconnect policy: `min(base * 2^attempt, cap)` between attempts, then a
/// fixed cooldown once `max_attempts` is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            cooldown_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Delay before a message whose persistence failed is redelivered.
    pub retry_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Datastore / API / Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// SQLite file holding aggregate stats and anomaly records.
    pub path: PathBuf,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/telemetry.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8100".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.log.endpoint, PathBuf::from("data/events.db"));
        assert_eq!(cfg.log.topic, "events");
        assert_eq!(cfg.log.consumer_group, "event_processor");
        assert_eq!(cfg.log.auto_offset_reset, OffsetReset::Latest);

        assert_eq!(cfg.thresholds.running.max_distance, 42_000.0);
        assert_eq!(cfg.thresholds.running.min_duration, 300.0);
        assert_eq!(cfg.thresholds.music.max_duration, 600.0);
        assert_eq!(cfg.thresholds.music.min_duration, 30.0);

        assert_eq!(cfg.pacing.max_messages, 1000);
        assert_eq!(cfg.pacing.max_elapsed_secs, 300);

        assert_eq!(cfg.retry.max_attempts, 10);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.retry.cooldown_secs, 60);

        assert_eq!(cfg.datastore.path, PathBuf::from("data/telemetry.db"));
        assert_eq!(cfg.api.bind, "0.0.0.0:8100");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[log]
endpoint = "/var/lib/telemetry/events.db"
topic = "telemetry"
consumer_group = "anomaly_detector_group"
auto_offset_reset = "earliest"
poll_interval_ms = 250

[thresholds.running]
max_distance = 50000
min_duration = 120

[thresholds.music]
max_duration = 900
min_duration = 10

[pacing]
max_messages = 50
max_elapsed_secs = 10
pause_ms = 5

[retry]
max_attempts = 3
base_delay_ms = 100
max_delay_ms = 1000
cooldown_secs = 5

[processing]
retry_delay_ms = 20

[datastore]
path = "/tmp/telemetry.db"

[api]
bind = "127.0.0.1:9000"

[logging]
level = "debug"
format = "json"
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.log.topic, "telemetry");
        assert_eq!(cfg.log.consumer_group, "anomaly_detector_group");
        assert_eq!(cfg.log.auto_offset_reset, OffsetReset::Earliest);
        assert_eq!(cfg.log.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.thresholds.running.max_distance, 50_000.0);
        assert_eq!(cfg.thresholds.running.min_duration, 120.0);
        assert_eq!(cfg.thresholds.music.max_duration, 900.0);
        assert_eq!(cfg.thresholds.music.min_duration, 10.0);
        assert_eq!(cfg.pacing.max_messages, 50);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.cooldown_secs, 5);
        assert_eq!(cfg.processing.retry_delay_ms, 20);
        assert_eq!(cfg.datastore.path, PathBuf::from("/tmp/telemetry.db"));
        assert_eq!(cfg.api.bind, "127.0.0.1:9000");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[thresholds.running]
max_distance = 21097
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.thresholds.running.max_distance, 21_097.0);
        // Sibling field in the same table keeps its default.
        assert_eq!(cfg.thresholds.running.min_duration, 300.0);
        assert_eq!(cfg.thresholds.music.max_duration, 600.0);
        assert_eq!(cfg.log.topic, "events");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[api]
bind = "0.0.0.0:9999"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.api.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = AppConfig::resolve(Some(Path::new("/nonexistent/telemetry.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = AppConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.log.topic, back.log.topic);
        assert_eq!(cfg.retry.max_delay_ms, back.retry.max_delay_ms);
        assert_eq!(cfg.thresholds.music.min_duration, back.thresholds.music.min_duration);
    }
}
