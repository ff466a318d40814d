//! Configuration loading using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults (a usable configuration for a 4-channel driver on `/dev/ttyUSB0`)
//! 2. A TOML file (`config/uv_exposure.toml` unless a path is given)
//! 3. Environment variables prefixed with `UVX_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use uv_exposure::config::Settings;
//!
//! // UVX_DEVICE__PORT=/dev/ttyACM0 overrides the file
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Driver port: {}", settings.device.port);
//! # Ok::<(), uv_exposure::error::AppError>(())
//! ```

use crate::error::{AppError, AppResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/uv_exposure.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "UVX_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Serial LED driver settings
    pub device: DeviceSettings,
    /// Procedure timing
    pub executor: ExecutorSettings,
    /// HTTP control surface
    pub server: ServerSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Serial LED driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM8")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Reply timeout per command
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Number of addressable channels on the driver
    pub channel_count: u8,
    /// Pause between consecutive channel switch-on commands
    #[serde(with = "humantime_serde")]
    pub channel_switch_delay: Duration,
    /// Terminator appended to every command
    pub line_terminator: String,
    /// Read one reply line after each command
    pub await_reply: bool,
    /// Replies starting with this prefix are treated as command rejections
    pub error_prefix: Option<String>,
    /// Command templates
    pub commands: CommandTemplates,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_secs(2),
            channel_count: 4,
            channel_switch_delay: Duration::from_millis(100),
            line_terminator: "\r".to_string(),
            await_reply: true,
            error_prefix: Some("ERR".to_string()),
            commands: CommandTemplates::default(),
        }
    }
}

/// Command templates sent to the driver.
///
/// Placeholders use `${name}` or `${name:0N}` (zero-padded to N digits).
/// `set_intensity` receives `value`, `energize_channel` receives `channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    /// Output level for every channel; `${value}` is the percentage
    pub set_intensity: String,
    /// Sent once per selected channel
    pub energize_channel: String,
    /// Turns every channel off
    pub deenergize_all: String,
    /// Hands the device to its front panel
    pub manual_control: String,
    /// Puts the device under serial control
    pub program_control: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            set_intensity: "STEP0,${value:03}".to_string(),
            energize_channel: "ON${channel}".to_string(),
            deenergize_all: "OFF0".to_string(),
            manual_control: "CNT0".to_string(),
            program_control: "CNT1".to_string(),
        }
    }
}

/// Procedure timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Grace period after energizing channels, before the first step
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Cancellation polling interval during step waits
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            tick: Duration::from_secs(1),
        }
    }
}

/// HTTP control surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address
    pub bind: String,
    /// Origins allowed by CORS (the operator front-end)
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            allowed_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

impl Settings {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Self::figment(path.as_ref()).extract()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading, reporting every problem at once
    pub fn validate(&self) -> AppResult<()> {
        let mut problems = Vec::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.device.port.trim().is_empty() {
            problems.push("device.port must not be empty".to_string());
        }
        if self.device.baud_rate == 0 {
            problems.push("device.baud_rate must be positive".to_string());
        }
        if self.device.channel_count == 0 {
            problems.push("device.channel_count must be at least 1".to_string());
        }
        if self.device.await_reply && self.device.timeout.is_zero() {
            problems.push("device.timeout must be positive when await_reply is set".to_string());
        }

        if self.executor.tick.is_zero() {
            problems.push("executor.tick must be positive".to_string());
        }

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!("Invalid server.bind address '{}'", self.server.bind));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AppError::Configuration(problems.join("; ")))
        }
    }
}
