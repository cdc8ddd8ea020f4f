//! Configuration for the mission sync engine.
//!
//! Configuration can be set via environment variables:
//! - `MISSION_SYNC_LOCAL_ID_PREFIX` - Optional. Reserved prefix for temporary mission ids. Defaults to `local-`.
//! - `MISSION_SYNC_COMMAND_TIMEOUT_SECS` - Optional. Backend round-trip timeout. Defaults to `30`.
//! - `MISSION_SYNC_LIST_LIMIT` - Optional. Page size used when refreshing the mission list. Defaults to `200`.
//! - `MISSION_SYNC_CURRENCY` - Optional. Currency for optimistic cost records. Defaults to `USD`.
//! - `MISSION_SYNC_CLEAR_ERROR_ON_SUCCESS` - Optional. Clear the notice slot after a successful command. Defaults to `true`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Prefix that marks a mission id as local (not yet confirmed by the backend)
    pub local_id_prefix: String,

    /// Upper bound on a single backend command round trip
    pub command_timeout: Duration,

    /// Page size for `mission.list` refreshes
    pub list_limit: usize,

    /// Currency used for optimistic cost records
    pub currency: String,

    /// Whether a successful command clears the transient notice slot
    pub clear_error_on_success: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_id_prefix: "local-".to_string(),
            command_timeout: Duration::from_secs(30),
            list_limit: 200,
            currency: "USD".to_string(),
            clear_error_on_success: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric or boolean variable cannot be parsed,
    /// or if the local id prefix is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let local_id_prefix = std::env::var("MISSION_SYNC_LOCAL_ID_PREFIX")
            .unwrap_or(defaults.local_id_prefix);
        if local_id_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "MISSION_SYNC_LOCAL_ID_PREFIX".to_string(),
                "prefix must not be empty".to_string(),
            ));
        }

        let command_timeout = std::env::var("MISSION_SYNC_COMMAND_TIMEOUT_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue(
                        "MISSION_SYNC_COMMAND_TIMEOUT_SECS".to_string(),
                        format!("{}", e),
                    )
                })
            })
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(defaults.command_timeout);

        let list_limit = std::env::var("MISSION_SYNC_LIST_LIMIT")
            .ok()
            .map(|v| {
                v.parse::<usize>().map_err(|e| {
                    ConfigError::InvalidValue("MISSION_SYNC_LIST_LIMIT".to_string(), format!("{}", e))
                })
            })
            .transpose()?
            .unwrap_or(defaults.list_limit);

        let currency = std::env::var("MISSION_SYNC_CURRENCY").unwrap_or(defaults.currency);

        let clear_error_on_success = std::env::var("MISSION_SYNC_CLEAR_ERROR_ON_SUCCESS")
            .ok()
            .map(|v| {
                parse_bool(&v).map_err(|e| {
                    ConfigError::InvalidValue("MISSION_SYNC_CLEAR_ERROR_ON_SUCCESS".to_string(), e)
                })
            })
            .transpose()?
            .unwrap_or(defaults.clear_error_on_success);

        Ok(Self {
            local_id_prefix,
            command_timeout,
            list_limit,
            currency,
            clear_error_on_success,
        })
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}
