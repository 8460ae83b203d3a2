// crates/challengectl-config/src/lib.rs
// ============================================================================
// Crate: challengectl-config
// Description: YAML configuration loading and validation for the controller
//              and runner agent binaries.
// Purpose: Turn an untrusted YAML file into a strongly typed, validated
//          tunables struct, failing closed on anything malformed.
// Dependencies: challengectl-core, serde, serde_yaml, thiserror
// ============================================================================

//! ## Overview
//! Configuration is loaded from a YAML file. Loading is strict and
//! fail-closed: oversized files, path traversal, and schema violations are
//! all rejected before a single field is interpreted, treating config input
//! as untrusted throughout.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "challengectl.yaml";
/// Environment variable used to override the controller config path.
pub const CONFIG_ENV_VAR: &str = "CHALLENGECTL_CONFIG";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

const fn default_poll_interval_ms() -> u64 {
    10_000
}
const fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
const fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}
const fn default_assignment_ttl_ms() -> u64 {
    300_000
}
const fn default_stale_sweep_interval_ms() -> u64 {
    30_000
}
const fn default_expired_token_sweep_interval_ms() -> u64 {
    60_000
}
const fn default_session_timeout_ms() -> u64 {
    24 * 60 * 60 * 1000
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Failure modes raised while loading or validating a [`ChallengeCtlConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The supplied path exceeded [`MAX_TOTAL_PATH_LENGTH`].
    #[error("config path exceeds max length")]
    PathTooLong,
    /// A single path component exceeded [`MAX_PATH_COMPONENT_LENGTH`].
    #[error("config path component too long")]
    PathComponentTooLong,
    /// The path contained a `..` component.
    #[error("config path must not contain parent directory components")]
    PathTraversal,
    /// No readable config file was found at the resolved path.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    /// The config file exceeded [`MAX_CONFIG_FILE_SIZE`].
    #[error("config file exceeds size limit")]
    TooLarge,
    /// The config file's bytes were not valid UTF-8.
    #[error("config file must be utf-8")]
    NotUtf8,
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(String),
    /// The file's contents did not parse as valid YAML matching the schema.
    #[error("failed to parse config yaml: {0}")]
    Parse(String),
    /// A field passed syntax but failed a semantic validation rule.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Tunables
// ============================================================================

/// Timing tunables validated into [`Duration`]s.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// How often the runner agent polls for work. Default 10s.
    pub poll_interval: Duration,
    /// How often the runner agent sends a heartbeat. Default 30s.
    pub heartbeat_interval: Duration,
    /// How long since the last heartbeat before a runner is marked offline. Default 90s.
    pub heartbeat_timeout: Duration,
    /// How long an assignment may go un-completed before it is requeued. Default 300s.
    pub assignment_ttl: Duration,
    /// Cadence of the stale-runner and stale-assignment sweeps. Default 30s.
    pub stale_sweep_interval: Duration,
    /// Cadence of the expired-token sweep. Default 60s.
    pub expired_token_sweep_interval: Duration,
    /// How long an admin session remains valid. Default 24h.
    pub session_timeout: Duration,
}

/// Raw, deserialized tunables section before validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
struct TunablesRaw {
    #[serde(rename = "poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(rename = "heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,
    #[serde(rename = "heartbeat_timeout_ms")]
    heartbeat_timeout_ms: u64,
    #[serde(rename = "assignment_ttl_ms")]
    assignment_ttl_ms: u64,
    #[serde(rename = "stale_sweep_interval_ms")]
    stale_sweep_interval_ms: u64,
    #[serde(rename = "expired_token_sweep_interval_ms")]
    expired_token_sweep_interval_ms: u64,
    #[serde(rename = "session_timeout_ms")]
    session_timeout_ms: u64,
}

impl Default for TunablesRaw {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            assignment_ttl_ms: default_assignment_ttl_ms(),
            stale_sweep_interval_ms: default_stale_sweep_interval_ms(),
            expired_token_sweep_interval_ms: default_expired_token_sweep_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl TunablesRaw {
    fn validate(&self) -> Result<Tunables, ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be > 0".to_owned()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".to_owned()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid("heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_owned()));
        }
        if self.assignment_ttl_ms == 0 {
            return Err(ConfigError::Invalid("assignment_ttl_ms must be > 0".to_owned()));
        }
        if self.stale_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("stale_sweep_interval_ms must be > 0".to_owned()));
        }
        if self.expired_token_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("expired_token_sweep_interval_ms must be > 0".to_owned()));
        }
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::Invalid("session_timeout_ms must be > 0".to_owned()));
        }
        Ok(Tunables {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            assignment_ttl: Duration::from_millis(self.assignment_ttl_ms),
            stale_sweep_interval: Duration::from_millis(self.stale_sweep_interval_ms),
            expired_token_sweep_interval: Duration::from_millis(self.expired_token_sweep_interval_ms),
            session_timeout: Duration::from_millis(self.session_timeout_ms),
        })
    }
}

// ============================================================================
// SECTION: Controller Config
// ============================================================================

/// Raw, deserialized controller config document.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct ControllerConfigRaw {
    bind_addr: String,
    #[serde(default)]
    tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    tls_key_path: Option<PathBuf>,
    sqlite_path: PathBuf,
    blob_store_dir: PathBuf,
    /// One-way (bcrypt) hash of the provisioning key; verified by C3 rule 2.
    provisioning_key_hash: String,
    #[serde(default)]
    tunables: TunablesRaw,
}

/// Validated controller configuration: everything the control plane API,
/// dispatch core, liveness monitor, store, and blob store need to start.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the HTTP listener binds to.
    pub bind_addr: SocketAddr,
    /// TLS certificate and key, if TLS termination is handled in-process.
    pub tls: Option<(PathBuf, PathBuf)>,
    /// Path to the SQLite database file.
    pub sqlite_path: PathBuf,
    /// Directory backing the content-addressed blob store.
    pub blob_store_dir: PathBuf,
    /// Bcrypt hash of the provisioning key (C3 rule 2).
    pub provisioning_key_hash: String,
    /// Validated timing tunables.
    pub tunables: Tunables,
}

impl ControllerConfig {
    /// Loads and validates the controller config.
    ///
    /// Resolution order: `path`, else the `CHALLENGECTL_CONFIG` environment
    /// variable, else `./challengectl.yaml` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on any path, size, encoding, parse, or
    /// semantic validation failure. Never partially applies a bad config.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        let raw = read_validated(&resolved)?;
        let parsed: ControllerConfigRaw = serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let bind_addr = parsed.bind_addr.parse::<SocketAddr>().map_err(|err| ConfigError::Invalid(format!("bind_addr: {err}")))?;
        let tls = match (parsed.tls_cert_path, parsed.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => return Err(ConfigError::Invalid("tls_cert_path and tls_key_path must be set together".to_owned())),
        };
        if parsed.provisioning_key_hash.is_empty() {
            return Err(ConfigError::Invalid("provisioning_key_hash must not be empty".to_owned()));
        }
        let tunables = parsed.tunables.validate()?;
        Ok(Self { bind_addr, tls, sqlite_path: parsed.sqlite_path, blob_store_dir: parsed.blob_store_dir, provisioning_key_hash: parsed.provisioning_key_hash, tunables })
    }
}

// ============================================================================
// SECTION: Runner Agent Config
// ============================================================================

/// Raw, deserialized runner agent config document.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RunnerConfigRaw {
    controller_base_url: String,
    #[serde(default)]
    api_key_path: Option<PathBuf>,
    #[serde(default)]
    enrollment_token: Option<String>,
    cache_dir: PathBuf,
    hostname: String,
    #[serde(default)]
    ip: String,
    mac: String,
    machine_id: String,
    devices: Vec<challengectl_core::Device>,
    /// Argv template for the opaque transmit callable. `{freq_hz}`,
    /// `{device}`, `{modulation}`, and `{file}` (repeated once per resolved
    /// file path) are substituted at invocation time.
    transmit_command: Vec<String>,
    /// Argv template for the optional spectrum-paint pre-pass.
    #[serde(default)]
    spectrum_paint_command: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    tunables: TunablesRaw,
}

/// Validated runner agent configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL of the controller's Control Plane API.
    pub controller_base_url: String,
    /// Where to persist the API key obtained from enrollment.
    pub api_key_path: PathBuf,
    /// One-time enrollment token used if `api_key_path` does not yet exist.
    pub enrollment_token: Option<String>,
    /// Directory backing the local content-addressed file cache.
    pub cache_dir: PathBuf,
    /// Hostname reported at registration.
    pub hostname: String,
    /// IP address reported at registration.
    pub ip: String,
    /// MAC address reported at enrollment/registration and presented as a
    /// host identifier on every subsequent request.
    pub mac: String,
    /// Machine identifier reported at enrollment/registration and presented
    /// as a host identifier on every subsequent request.
    pub machine_id: String,
    /// Devices (with frequency capabilities) this runner reports.
    pub devices: Vec<challengectl_core::Device>,
    /// Argv template for the transmit callable.
    pub transmit_command: Vec<String>,
    /// Argv template for the optional spectrum-paint pre-pass.
    pub spectrum_paint_command: Option<Vec<String>>,
    /// Working directory non-content-addressed file references resolve against.
    pub working_dir: PathBuf,
    /// Validated timing tunables.
    pub tunables: Tunables,
}

impl RunnerConfig {
    /// Loads and validates the runner agent config. Same resolution order
    /// and failure modes as [`ControllerConfig::load`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on any path, size, encoding, parse, or
    /// semantic validation failure.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        let raw = read_validated(&resolved)?;
        let parsed: RunnerConfigRaw = serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        if parsed.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("hostname must not be empty".to_owned()));
        }
        if parsed.mac.trim().is_empty() && parsed.machine_id.trim().is_empty() {
            return Err(ConfigError::Invalid("at least one of mac or machine_id must be set".to_owned()));
        }
        if parsed.transmit_command.is_empty() {
            return Err(ConfigError::Invalid("transmit_command must not be empty".to_owned()));
        }
        let tunables = parsed.tunables.validate()?;
        let api_key_path = parsed.api_key_path.unwrap_or_else(|| PathBuf::from("challengectl-runner.key"));
        let working_dir = parsed.working_dir.unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            controller_base_url: parsed.controller_base_url,
            api_key_path,
            enrollment_token: parsed.enrollment_token,
            cache_dir: parsed.cache_dir,
            hostname: parsed.hostname,
            ip: parsed.ip,
            mac: parsed.mac,
            machine_id: parsed.machine_id,
            devices: parsed.devices,
            transmit_command: parsed.transmit_command,
            spectrum_paint_command: parsed.spectrum_paint_command,
            working_dir,
            tunables,
        })
    }
}

// ============================================================================
// SECTION: Shared Loading Helpers
// ============================================================================

fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(given) = path {
        return validate_path_shape(given).map(Path::to_path_buf);
    }
    if let Ok(from_env) = env::var(CONFIG_ENV_VAR) {
        return validate_path_shape(Path::new(&from_env)).map(Path::to_path_buf);
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

fn validate_path_shape(path: &Path) -> Result<&Path, ConfigError> {
    let as_str = path.to_string_lossy();
    if as_str.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::PathTooLong);
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ConfigError::PathTraversal);
        }
        if let Component::Normal(part) = component {
            if part.len() > MAX_PATH_COMPONENT_LENGTH {
                return Err(ConfigError::PathComponentTooLong);
            }
        }
    }
    Ok(path)
}

fn read_validated(path: &Path) -> Result<String, ConfigError> {
    let metadata = fs::metadata(path).map_err(|_| ConfigError::NotFound(path.to_path_buf()))?;
    if metadata.len() as usize > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::TooLarge);
    }
    let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    String::from_utf8(bytes).map_err(|_| ConfigError::NotUtf8)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use super::*;

    #[test]
    fn tunables_defaults_match_spec_values() {
        let tunables = TunablesRaw::default().validate().expect("defaults are valid");
        assert_eq!(tunables.poll_interval, Duration::from_secs(10));
        assert_eq!(tunables.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(tunables.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(tunables.assignment_ttl, Duration::from_secs(300));
        assert_eq!(tunables.stale_sweep_interval, Duration::from_secs(30));
        assert_eq!(tunables.session_timeout, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn tunables_reject_timeout_not_exceeding_interval() {
        let mut raw = TunablesRaw::default();
        raw.heartbeat_timeout_ms = raw.heartbeat_interval_ms;
        assert!(raw.validate().is_err());
    }

    #[test]
    fn path_validation_rejects_traversal() {
        let err = validate_path_shape(Path::new("../secret.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::PathTraversal));
    }
}
