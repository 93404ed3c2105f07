//! Timing configuration for GATT sessions and expiring registries
//!
//! Every constant the session state machine and the registry rely on lives
//! here, serializable to/from JSON so deployments can tune them without a
//! rebuild. All durations are stored in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Retry interval for a connect attempt that neither succeeds nor fails
pub const DEFAULT_CONNECT_INTERNAL_TIMEOUT_MS: u64 = 9_000;
/// Overall deadline for a connect request, across all retries
pub const DEFAULT_CONNECT_EXTERNAL_TIMEOUT_MS: u64 = 17_000;
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;
/// Native disconnect completion is not always reported; force it after this long
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_DISCOVERY_DELAY_BONDED_MS: u64 = 1_600;
pub const DEFAULT_DISCOVERY_DELAY_UNBONDED_MS: u64 = 300;
pub const DEFAULT_ENTRY_TTL_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Session timing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    pub connect_internal_timeout_ms: u64,
    pub connect_external_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Settle delay before service discovery when the peripheral is bonded.
    /// Encryption is re-established after the link comes up and a Service
    /// Changed indication may follow a few hundred milliseconds later.
    pub discovery_delay_bonded_ms: u64,
    pub discovery_delay_unbonded_ms: u64,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            connect_internal_timeout_ms: DEFAULT_CONNECT_INTERNAL_TIMEOUT_MS,
            connect_external_timeout_ms: DEFAULT_CONNECT_EXTERNAL_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            discovery_delay_bonded_ms: DEFAULT_DISCOVERY_DELAY_BONDED_MS,
            discovery_delay_unbonded_ms: DEFAULT_DISCOVERY_DELAY_UNBONDED_MS,
        }
    }
}

impl GattConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeouts(mut self, internal_ms: u64, external_ms: u64) -> Self {
        self.connect_internal_timeout_ms = internal_ms;
        self.connect_external_timeout_ms = external_ms;
        self
    }

    pub fn with_operation_timeout(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }

    pub fn with_disconnect_timeout(mut self, ms: u64) -> Self {
        self.disconnect_timeout_ms = ms;
        self
    }

    pub fn with_discovery_delays(mut self, bonded_ms: u64, unbonded_ms: u64) -> Self {
        self.discovery_delay_bonded_ms = bonded_ms;
        self.discovery_delay_unbonded_ms = unbonded_ms;
        self
    }

    pub fn connect_internal_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_internal_timeout_ms)
    }

    pub fn connect_external_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_external_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Settle delay between link-up and service discovery
    pub fn discovery_delay(&self, bonded: bool) -> Duration {
        if bonded {
            Duration::from_millis(self.discovery_delay_bonded_ms)
        } else {
            Duration::from_millis(self.discovery_delay_unbonded_ms)
        }
    }

    /// Validate the configuration
    ///
    /// Key invariant: the internal connect timeout must fit inside the
    /// external deadline, otherwise no retry can ever happen.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_internal_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_internal_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.connect_external_timeout_ms < self.connect_internal_timeout_ms {
            return Err(ConfigError::Invalid(
                "connect_external_timeout_ms must be >= connect_internal_timeout_ms".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.disconnect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "disconnect_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expiring registry parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TTL applied by `put` when none is given; 0 disables expiry
    pub default_ttl_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_ENTRY_TTL_MS,
        }
    }
}

impl RegistryConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// Complete settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gatt: GattConfig,
    pub registry: RegistryConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gatt.validate()
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Validate and write settings to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
