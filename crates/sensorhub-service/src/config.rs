//! Service configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin HTTP server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Device polling and monitoring settings.
    pub device: DeviceConfig,
    /// Local-network discovery settings.
    pub mdns: MdnsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and collect every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.device.validate());
        errors.extend(self.mdns.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the admin API listens on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl ServerConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push(ValidationError {
                field: "server.port".to_string(),
                message: "port cannot be 0".to_string(),
            });
        }

        errors
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the registration and sample databases.
    pub cache_dir: PathBuf,
    /// Days to look back when restoring the latest device timestamp.
    /// Zero means unbounded.
    pub restore_range_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            restore_range_days: 30,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.cache_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.cache_dir".to_string(),
                message: "cache directory cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Device polling and monitoring settings. Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// How often to fetch data from each device.
    pub fetch_interval: u64,
    /// How long to wait for a device response.
    pub fetch_timeout: u64,
    /// Inactivity eviction settings.
    pub inactive: InactiveConfig,
    /// Device clock synchronization settings.
    pub time_sync: TimeSyncConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            fetch_interval: 10,
            fetch_timeout: 5,
            inactive: InactiveConfig::default(),
            time_sync: TimeSyncConfig::default(),
        }
    }
}

impl DeviceConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.fetch_interval == 0 {
            errors.push(ValidationError {
                field: "device.fetch_interval".to_string(),
                message: "fetch interval cannot be 0".to_string(),
            });
        }
        if self.fetch_timeout == 0 {
            errors.push(ValidationError {
                field: "device.fetch_timeout".to_string(),
                message: "fetch timeout cannot be 0".to_string(),
            });
        }

        errors.extend(self.inactive.validate());
        errors.extend(self.time_sync.validate());

        errors
    }
}

/// Inactivity eviction settings. Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InactiveConfig {
    /// Whether silent devices are evicted at all.
    pub enabled: bool,
    /// How long a device may stay silent before eviction.
    pub max_interval: u64,
    /// How often the inactivity check runs.
    pub update_interval: u64,
}

impl Default for InactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_interval: 3600,
            update_interval: 600,
        }
    }
}

impl InactiveConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled {
            if self.max_interval == 0 {
                errors.push(ValidationError {
                    field: "device.inactive.max_interval".to_string(),
                    message: "max inactivity interval cannot be 0".to_string(),
                });
            }
            if self.update_interval == 0 {
                errors.push(ValidationError {
                    field: "device.inactive.update_interval".to_string(),
                    message: "inactivity check interval cannot be 0".to_string(),
                });
            }
        }

        errors
    }
}

/// Device clock synchronization settings. Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    /// Whether invalid device clocks are synchronized. Timestamps are
    /// verified either way.
    pub enabled: bool,
    /// Maximum allowed difference between local and device time.
    /// Zero selects the plain positive-timestamp check.
    pub max_drift: u64,
    /// How often to retry restoring the last persisted timestamp.
    pub restore_interval: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_drift: 0,
            restore_interval: 10,
        }
    }
}

impl TimeSyncConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.restore_interval == 0 {
            errors.push(ValidationError {
                field: "device.time_sync.restore_interval".to_string(),
                message: "restore interval cannot be 0".to_string(),
            });
        }

        errors
    }
}

/// Local-network discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsConfig {
    /// Whether discovered devices are registered automatically.
    pub autodiscovery: bool,
    /// Browse settings.
    pub browse: BrowseConfig,
    /// Hub service announcement settings.
    pub server: MdnsServerConfig,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            autodiscovery: true,
            browse: BrowseConfig::default(),
            server: MdnsServerConfig::default(),
        }
    }
}

impl MdnsConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        errors.extend(self.browse.validate());
        errors.extend(self.server.validate());

        if self.autodiscovery && !self.browse.enabled {
            errors.push(ValidationError {
                field: "mdns.autodiscovery".to_string(),
                message: "autodiscovery requires mdns.browse.enabled".to_string(),
            });
        }

        errors
    }
}

/// Browse settings. Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowseConfig {
    /// Whether the hub browses the local network at all.
    pub enabled: bool,
    /// How often a browse round starts.
    pub interval: u64,
    /// How long a single browse round listens.
    pub timeout: u64,
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 40,
            timeout: 10,
        }
    }
}

impl BrowseConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled {
            if self.interval == 0 {
                errors.push(ValidationError {
                    field: "mdns.browse.interval".to_string(),
                    message: "browse interval cannot be 0".to_string(),
                });
            }
            if self.timeout == 0 {
                errors.push(ValidationError {
                    field: "mdns.browse.timeout".to_string(),
                    message: "browse timeout cannot be 0".to_string(),
                });
            }
            if self.timeout >= self.interval && self.interval != 0 {
                errors.push(ValidationError {
                    field: "mdns.browse.timeout".to_string(),
                    message: "browse timeout must be shorter than the interval".to_string(),
                });
            }
        }

        errors
    }
}

/// Hub service announcement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsServerConfig {
    /// Whether the hub announces its own HTTP API.
    pub enabled: bool,
    /// Machine DNS name to announce.
    pub hostname: String,
}

impl Default for MdnsServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hostname: "sensorhub.local".to_string(),
        }
    }
}

impl MdnsServerConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled && self.hostname.is_empty() {
            errors.push(ValidationError {
                field: "mdns.server.hostname".to_string(),
                message: "hostname cannot be empty when the announcer is enabled".to_string(),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with its field path.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
