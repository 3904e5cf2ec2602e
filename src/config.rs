use crate::fare::{FareError, RatePolicy};
use crate::pipeline::{DEFAULT_MIN_CAPTURE_INTERVAL, DEFAULT_RECENT_LIMIT, PipelineSettings};
use crate::reconcile::CameraLocations;
use crate::recognition::remote::{DEFAULT_ENDPOINT, DEFAULT_TIMEOUT};
use crate::recognition::{ConfidenceGate, DEFAULT_MIN_CONFIDENCE_PERCENT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_TOKEN_ENV: &str = "PLATE_RECOGNIZER_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub storage: Option<StorageSection>,
    #[serde(default)]
    pub recognition: Option<RecognitionSection>,
    #[serde(default)]
    pub capture: Option<CaptureSection>,
    #[serde(default)]
    pub cameras: Option<CamerasSection>,
    #[serde(default)]
    pub fare: Option<FareSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSection {
    /// SQLite database file. Empty or missing keeps sessions in memory.
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecognitionSection {
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API token.
    pub token_env: Option<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    pub camera_id: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Readings below this confidence percentage are discarded (default: 95)
    pub min_confidence_percent: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureSection {
    /// Minimum spacing between capture attempts per camera (default: 2000)
    pub min_interval_ms: Option<u64>,
    /// Size of the recent sessions cache (default: 100)
    pub recent_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CamerasSection {
    pub entry_location: Option<String>,
    pub exit_location: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FareSection {
    pub name: Option<String>,
    pub hourly_rate: f64,
    pub minimum_charge: f64,
    pub grace_period_minutes: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid [fare] section: {0}")]
    Fare(#[from] FareError),
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

impl Config {
    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    pub fn log_level(&self) -> tracing::Level {
        self.logging
            .level
            .parse::<tracing::Level>()
            .unwrap_or(tracing::Level::INFO)
    }

    pub fn database_path(&self) -> Option<&Path> {
        let path = self.storage.as_ref()?.database_path.as_deref()?;
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }

    pub fn recognition_endpoint(&self) -> &str {
        self.recognition
            .as_ref()
            .and_then(|r| r.endpoint.as_deref())
            .filter(|endpoint| !endpoint.trim().is_empty())
            .unwrap_or(DEFAULT_ENDPOINT)
    }

    pub fn recognition_token_env(&self) -> &str {
        self.recognition
            .as_ref()
            .and_then(|r| r.token_env.as_deref())
            .unwrap_or(DEFAULT_TOKEN_ENV)
    }

    pub fn recognition_regions(&self) -> Vec<String> {
        self.recognition
            .as_ref()
            .map(|r| r.regions.clone())
            .unwrap_or_default()
    }

    pub fn recognition_camera_id(&self) -> Option<String> {
        self.recognition.as_ref().and_then(|r| r.camera_id.clone())
    }

    pub fn recognition_timeout(&self) -> Duration {
        self.recognition
            .as_ref()
            .and_then(|r| r.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn min_confidence(&self) -> f64 {
        self.recognition
            .as_ref()
            .and_then(|r| r.min_confidence_percent)
            .unwrap_or(DEFAULT_MIN_CONFIDENCE_PERCENT)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let capture = self.capture.as_ref();
        PipelineSettings {
            gate: ConfidenceGate::new(self.min_confidence()),
            min_capture_interval: capture
                .and_then(|c| c.min_interval_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_MIN_CAPTURE_INTERVAL),
            recent_limit: capture
                .and_then(|c| c.recent_limit)
                .unwrap_or(DEFAULT_RECENT_LIMIT),
        }
    }

    pub fn camera_locations(&self) -> CameraLocations {
        let defaults = CameraLocations::default();
        let Some(cameras) = self.cameras.as_ref() else {
            return defaults;
        };
        CameraLocations {
            entry: cameras.entry_location.clone().unwrap_or(defaults.entry),
            exit: cameras.exit_location.clone().unwrap_or(defaults.exit),
        }
    }

    /// Validated seed policy from `[fare]`, if configured.
    pub fn seed_rate(&self, created_at: OffsetDateTime) -> Result<Option<RatePolicy>, ConfigError> {
        let Some(fare) = self.fare.as_ref() else {
            return Ok(None);
        };
        let name = fare.name.clone().unwrap_or_else(|| "configured".to_string());
        let policy = RatePolicy::new(
            name,
            fare.hourly_rate,
            fare.minimum_charge,
            fare.grace_period_minutes,
            created_at,
        )?;
        Ok(Some(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp(name: &str, contents: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("parkwatch-{name}-{unique}.toml"));
        fs::write(&path, contents)?;
        Ok(path)
    }

    const MINIMAL: &str = r#"
[app]
name = "parkwatch"

[logging]
level = "info"
"#;

    #[test]
    fn default_config_loads_with_high_precision_gate() -> Result<(), Box<dyn std::error::Error>> {
        let config = load_default()?;

        assert_eq!(config.min_confidence(), 95.0);
        assert_eq!(config.recognition_token_env(), DEFAULT_TOKEN_ENV);
        Ok(())
    }

    #[test]
    fn minimal_config_uses_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("minimal", MINIMAL)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert_eq!(config.server_port(), DEFAULT_SERVER_PORT);
        assert!(config.database_path().is_none());
        assert_eq!(config.recognition_endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.camera_locations(), CameraLocations::default());
        assert_eq!(config.pipeline_settings(), PipelineSettings::default());
        assert!(config.seed_rate(OffsetDateTime::UNIX_EPOCH)?.is_none());
        assert_eq!(config.log_level(), tracing::Level::INFO);
        Ok(())
    }

    #[test]
    fn empty_database_path_is_treated_as_missing() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[storage]\ndatabase_path = \"\"\n");
        let path = write_temp("empty-db", &contents)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert!(config.database_path().is_none());
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!(
            r#"{MINIMAL}
[server]
port = 9090

[recognition]
min_confidence_percent = 70.0
regions = ["us-ca", "us-ny"]

[capture]
min_interval_ms = 500
recent_limit = 25

[cameras]
entry_location = "North Ramp"

[fare]
name = "weekday"
hourly_rate = 4.5
minimum_charge = 2.0
grace_period_minutes = 10
"#
        );
        let path = write_temp("overrides", &contents)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert_eq!(config.server_port(), 9090);
        assert_eq!(config.min_confidence(), 70.0);
        assert_eq!(config.recognition_regions(), vec!["us-ca", "us-ny"]);
        let settings = config.pipeline_settings();
        assert_eq!(settings.min_capture_interval, Duration::from_millis(500));
        assert_eq!(settings.recent_limit, 25);
        let locations = config.camera_locations();
        assert_eq!(locations.entry, "North Ramp");
        assert_eq!(locations.exit, "Exit Gate");
        let seed = config
            .seed_rate(OffsetDateTime::UNIX_EPOCH)?
            .ok_or("seed rate missing")?;
        assert_eq!(seed.name, "weekday");
        assert_eq!(seed.hourly_rate, 4.5);
        Ok(())
    }

    #[test]
    fn invalid_fare_section_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!(
            "{MINIMAL}\n[fare]\nhourly_rate = 0.0\nminimum_charge = 1.0\ngrace_period_minutes = 5\n"
        );
        let path = write_temp("bad-fare", &contents)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert!(matches!(
            config.seed_rate(OffsetDateTime::UNIX_EPOCH),
            Err(ConfigError::Fare(_))
        ));
        Ok(())
    }

    #[test]
    fn missing_config_file_returns_read_error() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("parkwatch-missing-{unique}.toml"));

        let result = load_from_path(&path);

        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn invalid_toml_returns_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("invalid", "not = [valid")?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        Ok(())
    }
}
