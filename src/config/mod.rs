//! Configuration management
//!
//! This module handles application configuration including:
//! - Loading and saving the TOML configuration file
//! - Managing the configuration directory
//! - Providing defaults for capture, transport and viewer settings
//! - Validation of value ranges

use crate::codec::ImageCodec;
use crate::error::{ConfigError, ConfigResult};
use crate::logging::LogLevel;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";
const CERT_DIR_NAME: &str = "certs";

const DEFAULT_FPS: u8 = 30;
const DEFAULT_FAULT_TTL_SECS: u64 = 10;
const DEFAULT_NO_CHANGE_DELAY_MS: u64 = 10;
const DEFAULT_AFTER_FAILURE_DELAY_MS: u64 = 100;
const DEFAULT_DISPLAY_POLL_MS: u64 = 2000;
const DEFAULT_JPEG_QUALITY: u8 = 75;
const DEFAULT_MIN_JPEG_QUALITY: u8 = 20;
const DEFAULT_TARGET_MBPS: f64 = 5.0;

/// 64 MiB; a full 8K BGRA keyframe encoded as PNG stays well below this
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_QUIC_SERVER_NAME: &str = "localhost";
const DEFAULT_MAX_VIEWERS: usize = 1;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Screen capture configuration
    pub capture: CaptureSettings,

    /// Wire transport configuration
    pub transport: TransportSettings,

    /// Host session configuration
    pub host: HostSettings,

    /// Viewer configuration
    pub viewer: ViewerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Screen capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Target capture iterations per second
    pub fps: u8,

    /// Composite the pointer into captured frames
    pub capture_cursor: bool,

    /// Try the GPU duplication path before the software copy
    pub prefer_gpu: bool,

    /// How long a faulted display skips the GPU path
    pub fault_ttl_secs: u64,

    /// Pause after a poll that reported no changes
    pub no_change_delay_ms: u64,

    /// Pause after a failed capture
    pub after_failure_delay_ms: u64,

    /// How often the display set is enumerated again; 0 disables polling
    pub display_poll_ms: u64,

    /// Image format for region payloads
    pub codec: ImageCodec,

    /// Starting (and keyframe) JPEG quality
    pub jpeg_quality: u8,

    /// Floor for adaptive JPEG quality
    pub min_jpeg_quality: u8,

    /// Bandwidth the adaptive quality aims for
    pub target_mbps: f64,
}

/// Wire transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Hard cap on a single payload, checked before allocation
    pub max_payload_size: usize,

    /// Upper bound for the graceful shutdown on close
    pub close_timeout_secs: u64,

    /// Upper bound for establishing a connection
    pub connect_timeout_secs: u64,

    /// TLS server name used for `quic://` connections
    pub quic_server_name: String,
}

/// Host session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Viewers served at once; each one runs its own capture pipeline
    pub max_viewers: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            max_viewers: DEFAULT_MAX_VIEWERS,
        }
    }
}

/// Viewer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    /// Where to write the rendered surface when the session ends
    pub snapshot_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset
    pub level: LogLevel,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            capture_cursor: true,
            prefer_gpu: true,
            fault_ttl_secs: DEFAULT_FAULT_TTL_SECS,
            no_change_delay_ms: DEFAULT_NO_CHANGE_DELAY_MS,
            after_failure_delay_ms: DEFAULT_AFTER_FAILURE_DELAY_MS,
            display_poll_ms: DEFAULT_DISPLAY_POLL_MS,
            codec: ImageCodec::Png,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            min_jpeg_quality: DEFAULT_MIN_JPEG_QUALITY,
            target_mbps: DEFAULT_TARGET_MBPS,
        }
    }
}

impl CaptureSettings {
    /// Returns the interval between capture iterations
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }

    /// Returns the fault cache TTL
    pub fn fault_ttl(&self) -> Duration {
        Duration::from_secs(self.fault_ttl_secs)
    }

    /// Returns the pause after an idle poll
    pub fn no_change_delay(&self) -> Duration {
        Duration::from_millis(self.no_change_delay_ms)
    }

    /// Returns the pause after a failed capture
    pub fn after_failure_delay(&self) -> Duration {
        Duration::from_millis(self.after_failure_delay_ms)
    }

    /// Returns the display poll interval, or `None` when polling is off
    pub fn display_poll_interval(&self) -> Option<Duration> {
        (self.display_poll_ms > 0).then(|| Duration::from_millis(self.display_poll_ms))
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            quic_server_name: DEFAULT_QUIC_SERVER_NAME.to_string(),
        }
    }
}

impl TransportSettings {
    /// Returns the graceful close timeout
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Returns the connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager rooted at the platform config directory
    ///
    /// # Errors
    ///
    /// Returns error if project directory cannot be determined
    pub fn new() -> ConfigResult<Self> {
        let config_dir = Self::get_config_directory()?;
        Ok(Self::with_directory(config_dir))
    }

    /// Creates a ConfigManager rooted at an explicit directory
    pub fn with_directory(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        Self {
            config_dir,
            config_file,
        }
    }

    fn get_config_directory() -> ConfigResult<PathBuf> {
        ProjectDirs::from("com", "remotedesk", "RemoteDeskStream")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::DirectoryNotFound(
                    "Could not determine configuration directory".to_string(),
                )
            })
    }

    fn ensure_config_directory(&self) -> ConfigResult<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).map_err(|e| {
                ConfigError::DirectoryCreationFailed(format!(
                    "Failed to create config directory at {:?}: {}",
                    self.config_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads configuration from file, or creates default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or created
    pub fn load_or_create_default(&self) -> ConfigResult<Config> {
        self.ensure_config_directory()?;

        if self.config_file.exists() {
            self.load()
        } else {
            let config = Config::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    fn load(&self) -> ConfigResult<Config> {
        let content = fs::read_to_string(&self.config_file)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to parse config file: {}", e)))?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Saves configuration to file
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid or cannot be written
    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        self.ensure_config_directory()?;
        Self::validate(config)?;

        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_file, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validates configuration values
    pub fn validate(config: &Config) -> ConfigResult<()> {
        let capture = &config.capture;

        if capture.fps == 0 || capture.fps > 60 {
            return Err(ConfigError::InvalidValue(
                "FPS must be between 1 and 60".to_string(),
            ));
        }

        if capture.jpeg_quality == 0 || capture.jpeg_quality > 100 {
            return Err(ConfigError::InvalidValue(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }

        if capture.min_jpeg_quality == 0 || capture.min_jpeg_quality > capture.jpeg_quality {
            return Err(ConfigError::InvalidValue(
                "Minimum JPEG quality must be between 1 and the JPEG quality".to_string(),
            ));
        }

        if capture.target_mbps.is_nan() || capture.target_mbps <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "Target Mbps must be positive".to_string(),
            ));
        }

        if config.host.max_viewers == 0 {
            return Err(ConfigError::InvalidValue(
                "Max viewers must be at least 1".to_string(),
            ));
        }

        let max = config.transport.max_payload_size;
        if max == 0 || max > i32::MAX as usize {
            return Err(ConfigError::InvalidValue(format!(
                "Max payload size must be between 1 and {}",
                i32::MAX
            )));
        }

        Ok(())
    }

    /// Gets the directory holding the QUIC certificate pair
    pub fn cert_directory(&self) -> PathBuf {
        self.config_dir.join(CERT_DIR_NAME)
    }

    /// Gets the configuration directory path
    pub fn config_directory(&self) -> &Path {
        &self.config_dir
    }
}
