//! Configuration parsing and management.
//!
//! This module handles parsing of the elevd configuration file (TOML) that
//! defines the privileged group, policy lists, timeout overrides, and the
//! reconciler interval.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level elevd configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ElevdConfig {
    /// Daemon paths and the managed group.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Authorization policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Grant timeout settings.
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Reconciliation sweep settings.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

impl ElevdConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the reconciler interval is
    /// outside `[1, 3600]` seconds, the base timeout is zero, or the managed
    /// group name is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.privileged_group.trim().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.privileged_group must not be empty".to_string(),
            ));
        }
        if self.timeout.base_minutes == 0 {
            return Err(ConfigError::Validation(
                "timeout.base_minutes must be at least 1".to_string(),
            ));
        }
        let interval = self.reconciler.interval_secs;
        if !(MIN_SWEEP_INTERVAL_SECS..=MAX_SWEEP_INTERVAL_SECS).contains(&interval) {
            return Err(ConfigError::Validation(format!(
                "reconciler.interval_secs out of range: {interval} \
                 (allowed {MIN_SWEEP_INTERVAL_SECS}..={MAX_SWEEP_INTERVAL_SECS})"
            )));
        }
        Ok(())
    }
}

/// Minimum allowed reconciliation sweep interval.
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 1;

/// Maximum allowed reconciliation sweep interval.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Daemon paths and the managed group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonSection {
    /// Name of the privileged local group this service manages.
    #[serde(default = "default_privileged_group")]
    pub privileged_group: String,

    /// Path to the request socket.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Path to the persisted grant ledger.
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            privileged_group: default_privileged_group(),
            socket: default_socket(),
            ledger_file: default_ledger_file(),
        }
    }
}

fn default_privileged_group() -> String {
    "sudo".to_string()
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/elevd/elevd.sock")
}

fn default_ledger_file() -> PathBuf {
    PathBuf::from("/var/lib/elevd/ledger.json")
}

/// Authorization policy lists.
///
/// Allow-list semantics follow deny-wins evaluation:
/// - a `None` allow list is an open policy (everyone passes the allow side),
/// - a present-but-empty allow list is a closed policy (no one passes),
/// - deny entries always win over allow entries.
///
/// Entries may be authored as stable principal identifiers or as resolved
/// account names; both are matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Allow list for locally-originated requests.
    #[serde(default)]
    pub local_allow: Option<Vec<String>>,

    /// Deny list for locally-originated requests.
    #[serde(default)]
    pub local_deny: Vec<String>,

    /// Allow list applied additionally to remote-origin requests.
    #[serde(default)]
    pub remote_allow: Option<Vec<String>>,

    /// Deny list applied additionally to remote-origin requests.
    #[serde(default)]
    pub remote_deny: Vec<String>,

    /// Principals or groups eligible for non-expiring automatic grants.
    ///
    /// Unlike `local_allow`, an empty list here simply means no one
    /// qualifies; there is no open/closed distinction for automatic adds.
    #[serde(default)]
    pub automatic_allow: Vec<String>,

    /// Principals or groups excluded from automatic grants (wins over
    /// `automatic_allow`).
    #[serde(default)]
    pub automatic_deny: Vec<String>,

    /// Revoke a principal's grant when its last logon session ends.
    #[serde(default = "default_true")]
    pub remove_on_logout: bool,

    /// When an outside process removes a still-valid grant from the live
    /// group, restore it (`true`) or accept the removal as authoritative and
    /// drop the ledger entry (`false`).
    #[serde(default)]
    pub restore_external_removals: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            local_allow: None,
            local_deny: Vec::new(),
            remote_allow: None,
            remote_deny: Vec::new(),
            automatic_allow: Vec::new(),
            automatic_deny: Vec::new(),
            remove_on_logout: true,
            restore_external_removals: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Grant timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Base grant duration in minutes.
    #[serde(default = "default_base_minutes")]
    pub base_minutes: u32,

    /// Per-principal/per-group overrides, keyed by principal identifier or
    /// account name. Values are parsed as integer minutes at evaluation
    /// time; unparsable entries are skipped. The maximum of all matching
    /// overrides (and the base) wins.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_minutes: default_base_minutes(),
            overrides: HashMap::new(),
        }
    }
}

const fn default_base_minutes() -> u32 {
    15
}

/// Reconciliation sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Seconds between sweeps. Bounded to `[1, 3600]`.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

const fn default_sweep_interval() -> u64 {
    10
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
