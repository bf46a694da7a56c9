//! Configuration for the sensor relay.
//!
//! The configuration is a plain value: it is loaded once, CLI overrides are
//! applied to produce a new value, and each component receives the section it
//! needs at construction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Baud rates the board firmware supports.
pub const SUPPORTED_BAUD_RATES: [u32; 8] = [4800, 9600, 14400, 19200, 28800, 38400, 57600, 115200];

/// Main configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Evaluation server connection
    pub server: ServerConfig,

    /// Serial link to the sensor board
    pub serial: SerialConfig,

    /// Windowing and voting parameters
    pub pipeline: PipelineConfig,

    /// Handshake timing
    pub handshake: HandshakeConfig,

    /// Unit conversion for power and energy
    pub energy: EnergyConfig,

    /// Abort on link and connect failures instead of retrying
    pub fail_fast: bool,

    /// Pause before retrying a failed link operation when not failing fast
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,

    /// Path for storing session statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-relay");

        Self {
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
            pipeline: PipelineConfig::default(),
            handshake: HandshakeConfig::default(),
            energy: EnergyConfig::default(),
            fail_fast: true,
            retry_delay: Duration::from_secs(1),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-relay")
            .join("config.json")
    }

    /// Path of the persisted session statistics.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Check every section for values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.serial.validate()?;
        self.pipeline.validate()?;
        self.energy.validate()?;
        Ok(())
    }

    /// A copy with the key hidden, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.server.key.is_some() {
            config.server.key = Some("********".into());
        }
        config
    }
}

/// Evaluation server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Pre-shared AES key (16, 24 or 32 characters)
    pub key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8888,
            key: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` for display and connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.key.as_ref().map(|k| k.len()) {
            None | Some(16 | 24 | 32) => Ok(()),
            Some(n) => Err(ConfigError::Invalid(format!(
                "key must be 16, 24 or 32 characters, got {n}"
            ))),
        }
    }
}

/// Serial port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyAMA0`
    pub port: String,
    pub baud_rate: u32,
    /// How long a single read may block
    #[serde(with = "duration_millis")]
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".into(),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::Invalid(format!(
                "unsupported baud rate {} (expected one of {:?})",
                self.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid("read timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Windowing, voting and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Movement readings per classified window
    pub frame_length: usize,

    /// Fraction of a window carried into the next one
    pub overlap_ratio: f64,

    /// Pause before each frame read; zero reads back to back
    #[serde(with = "duration_millis")]
    pub sampling_interval: Duration,

    /// Candidate labels per vote (K)
    pub votes_required: usize,

    /// Consecutive bad frames that force a new handshake
    pub error_threshold: u32,

    /// Pause before each move to allow for human reaction time
    #[serde(with = "duration_millis")]
    pub reaction_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_length: 20,
            overlap_ratio: 0.5,
            sampling_interval: Duration::ZERO,
            votes_required: 3,
            error_threshold: 3,
            reaction_delay: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Entries dropped from the front of the buffer after each window,
    /// `floor(frame_length × (1 − overlap_ratio))`.
    pub fn overlap_count(&self) -> usize {
        (self.frame_length as f64 * (1.0 - self.overlap_ratio)).floor() as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_length == 0 {
            return Err(ConfigError::Invalid("frame length must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return Err(ConfigError::Invalid(format!(
                "overlap ratio {} outside [0, 1)",
                self.overlap_ratio
            )));
        }
        if self.overlap_count() == 0 {
            return Err(ConfigError::Invalid(format!(
                "overlap ratio {} leaves no new readings per window of {}",
                self.overlap_ratio, self.frame_length
            )));
        }
        if self.votes_required < 2 {
            return Err(ConfigError::Invalid(
                "at least 2 votes are needed for a majority".into(),
            ));
        }
        if self.error_threshold == 0 {
            return Err(ConfigError::Invalid("error threshold must be positive".into()));
        }
        Ok(())
    }
}

/// Handshake timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Wait between sending `H` and reading the reply
    #[serde(with = "duration_millis")]
    pub response_wait: Duration,

    /// Wait after acknowledging, before flushing input
    #[serde(with = "duration_millis")]
    pub settle: Duration,

    /// Wait after a forced resync before restarting the stream
    #[serde(with = "duration_millis")]
    pub resync_pause: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            response_wait: Duration::from_secs(1),
            settle: Duration::from_secs(3),
            resync_pause: Duration::from_secs(5),
        }
    }
}

/// Unit conversion applied to every power computation.
///
/// Current is reported in amperes. With the defaults it is sent as
/// milliamperes, instantaneous power comes out in milliwatts, and cumulative
/// energy is integrated in joules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Multiplier from the board's current reading to the reported unit
    pub current_scale: f64,

    /// Multiplier from the reported power unit to watts
    pub power_to_watts: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            current_scale: 1000.0,
            power_to_watts: 0.001,
        }
    }
}

impl EnergyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.current_scale.is_finite() && self.current_scale > 0.0)
            || !(self.power_to_watts.is_finite() && self.power_to_watts > 0.0)
        {
            return Err(ConfigError::Invalid(
                "energy scale factors must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
