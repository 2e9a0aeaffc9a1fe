//! Agent configuration loading from file and environment variables.

use iin_types::{AgentEndpoint, SecurityDomainDns, SecurityDomainMemberIdentity};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// This agent's identity and key material.
    #[serde(default)]
    pub agent: AgentSection,

    /// Protocol timing.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// `[dns.<securityDomain>.<memberId>]` tables.
    #[serde(default)]
    pub dns: BTreeMap<String, BTreeMap<String, AgentEndpoint>>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "iin_protocol=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Who this agent is and where its key material lives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub security_domain: String,

    #[serde(default)]
    pub member_id: String,

    /// Hex-encoded 32-byte Ed25519 secret key.
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: String,

    /// PEM certificate issued for the signing key.
    #[serde(default = "default_certificate_path")]
    pub certificate_path: String,

    /// Optional JSON `Membership` of the local domain, loaded at startup.
    #[serde(default)]
    pub local_membership_path: Option<String>,
}

/// Protocol timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Seconds a cached foreign membership claim stays fresh.
    #[serde(default = "default_attestation_validity_time")]
    pub attestation_validity_time: u64,

    /// Seconds after which an unfinished run is swept.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Periodically sync every foreign domain.
    #[serde(default)]
    pub auto_sync: bool,

    /// Seconds between automatic syncs.
    #[serde(default = "default_sync_period")]
    pub sync_period: u64,

    /// Timeout for outbound RPCs in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    9500
}

fn default_db_path() -> String {
    "iin-agent.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_signing_key_path() -> String {
    "agent.key".to_string()
}

fn default_certificate_path() -> String {
    "agent.pem".to_string()
}

fn default_attestation_validity_time() -> u64 {
    300
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_sync_period() -> u64 {
    3600
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            attestation_validity_time: default_attestation_validity_time(),
            run_timeout_secs: default_run_timeout_secs(),
            auto_sync: false,
            sync_period: default_sync_period(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ProtocolConfig {
    pub fn refresh_time(&self) -> Duration {
        Duration::from_secs(self.attestation_validity_time)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    pub fn identity(&self) -> SecurityDomainMemberIdentity {
        SecurityDomainMemberIdentity::new(&self.agent.security_domain, &self.agent.member_id)
    }

    pub fn security_domain_dns(&self) -> SecurityDomainDns {
        let mut dns = SecurityDomainDns::new();
        for (domain, members) in &self.dns {
            for (member, endpoint) in members {
                dns.insert(
                    &SecurityDomainMemberIdentity::new(domain, member),
                    endpoint.clone(),
                );
            }
        }
        dns
    }

    /// Checks the settings the agent cannot start without.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.security_domain.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agent.security_domain is required".to_string(),
            ));
        }
        if self.agent.member_id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.member_id is required".to_string()));
        }
        let identity = self.identity();
        if self.security_domain_dns().endpoint(&identity).is_none() {
            return Err(ConfigError::Invalid(format!(
                "no [dns.{}.{}] entry for this agent",
                identity.security_domain, identity.member_id
            )));
        }
        if self.protocol.auto_sync && self.protocol.sync_period == 0 {
            return Err(ConfigError::Invalid(
                "protocol.sync_period must be positive when auto_sync is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but cannot run an agent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `IIN_HOST` overrides `server.host`
/// - `IIN_PORT` overrides `server.port`
/// - `IIN_DB_PATH` overrides `database.path`
/// - `IIN_LOG_LEVEL` overrides `logging.level`
/// - `IIN_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `IIN_SECURITY_DOMAIN` overrides `agent.security_domain`
/// - `IIN_MEMBER_ID` overrides `agent.member_id`
/// - `ATTESTATION_VALIDITY_TIME` overrides `protocol.attestation_validity_time`
/// - `AUTO_SYNC` overrides `protocol.auto_sync`
/// - `SYNC_PERIOD` overrides `protocol.sync_period`
///
/// The result is not validated; call [`Config::validate`] before starting.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("IIN_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("IIN_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(db_path) = var("IIN_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("IIN_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("IIN_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
    if let Some(domain) = var("IIN_SECURITY_DOMAIN") {
        config.agent.security_domain = domain;
    }
    if let Some(member) = var("IIN_MEMBER_ID") {
        config.agent.member_id = member;
    }
    if let Some(parsed) = var("ATTESTATION_VALIDITY_TIME").and_then(|v| v.parse().ok()) {
        config.protocol.attestation_validity_time = parsed;
    }
    if let Some(auto_sync) = var("AUTO_SYNC") {
        config.protocol.auto_sync = is_truthy(&auto_sync);
    }
    if let Some(parsed) = var("SYNC_PERIOD").and_then(|v| v.parse().ok()) {
        config.protocol.sync_period = parsed;
    }
}

fn is_truthy(value: &str) -> bool {
    value == "true" || value == "1"
}
