//! Configuration types for proxyrot
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest cooldown a `chrono::TimeDelta` can hold (it counts milliseconds in an i64)
pub const MAX_COOLDOWN_SECS: u64 = (i64::MAX / 1000) as u64;

/// Main proxyrot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyrotConfig {
    /// Rotation engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Remote proxy layout
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Outbound verifier settings
    #[serde(default)]
    pub verifier: VerifierConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Remote-command channel settings
    #[serde(default)]
    pub ssh: SshConfig,
}

impl ProxyrotConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.engine.validate()?;
        self.remote.validate()?;
        self.verifier.validate()?;
        self.store.validate()?;
        self.ssh.validate()?;
        Ok(())
    }
}

/// Rotation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum time between two successful rotations of the same port (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Capacity of the rotation event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        if self.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(crate::Error::config(format!(
                "Cooldown must be at most {} seconds. Got: {}",
                MAX_COOLDOWN_SECS, self.cooldown_secs
            )));
        }
        Ok(())
    }

    /// Cooldown as a duration, saturating for values `validate` rejects
    pub fn cooldown(&self) -> chrono::Duration {
        i64::try_from(self.cooldown_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Layout of the proxy configuration on the remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Directory holding the per-user fragments and the ACL file
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Suffix appended to a fragment path to form its backup path
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,

    /// File listing each user's ports (`acl <user>_ports myportname port1000 ...`)
    #[serde(default = "default_acl_file")]
    pub acl_file: String,

    /// Command that parses the configuration without activating it
    #[serde(default = "default_validate_command")]
    pub validate_command: String,

    /// Command that reloads the running proxy
    #[serde(default = "default_reconfigure_command")]
    pub reconfigure_command: String,
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.config_dir.trim_end_matches('/').is_empty() {
            return Err(crate::Error::config("Remote config directory cannot be empty"));
        }
        if self.backup_suffix.is_empty() {
            return Err(crate::Error::config("Backup suffix cannot be empty"));
        }
        if self.validate_command.is_empty() || self.reconfigure_command.is_empty() {
            return Err(crate::Error::config("Proxy control commands cannot be empty"));
        }
        Ok(())
    }

    /// Path of a user's fragment on the remote host
    pub fn fragment_path(&self, proxy_username: &str) -> String {
        format!(
            "{}/user_ports_{}.conf",
            self.config_dir.trim_end_matches('/'),
            proxy_username
        )
    }

    /// Backup path for a fragment
    pub fn backup_path(&self, fragment_path: &str) -> String {
        format!("{}{}", fragment_path, self.backup_suffix)
    }

    /// Path of the ACL file on the remote host
    pub fn acl_path(&self) -> String {
        format!("{}/{}", self.config_dir.trim_end_matches('/'), self.acl_file)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            backup_suffix: default_backup_suffix(),
            acl_file: default_acl_file(),
            validate_command: default_validate_command(),
            reconfigure_command: default_reconfigure_command(),
        }
    }
}

/// Outbound verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Probe the egress IP after each rotation
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe implementation name (registered in the backend registry)
    #[serde(default = "default_probe_type")]
    pub probe_type: String,

    /// Endpoint returning the caller's IP as plain text
    #[serde(default = "default_verifier_url")]
    pub url: String,

    /// Total probe attempts
    #[serde(default = "default_verifier_attempts")]
    pub attempts: usize,

    /// Delay between attempts (seconds), covers the proxy's reload latency
    #[serde(default = "default_verifier_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Per-attempt timeout (seconds)
    #[serde(default = "default_verifier_timeout_secs")]
    pub timeout_secs: u64,
}

impl VerifierConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.url.starts_with("https://") && !self.url.starts_with("http://") {
            return Err(crate::Error::config(format!(
                "Verifier URL must use HTTP or HTTPS scheme. Got: {}",
                self.url
            )));
        }
        if self.attempts == 0 {
            return Err(crate::Error::config("Verifier attempts must be > 0"));
        }
        if !(1..=30).contains(&self.timeout_secs) {
            return Err(crate::Error::config(format!(
                "Verifier timeout must be between 1 and 30 seconds. Got: {}",
                self.timeout_secs
            )));
        }
        Ok(())
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_type: default_probe_type(),
            url: default_verifier_url(),
            attempts: default_verifier_attempts(),
            retry_delay_secs: default_verifier_retry_delay_secs(),
            timeout_secs: default_verifier_timeout_secs(),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// JSON file store
    File {
        /// Path to the store file
        path: PathBuf,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let StoreConfig::File { path } = self
            && path.as_os_str().is_empty()
        {
            return Err(crate::Error::config("Store path cannot be empty"));
        }
        Ok(())
    }
}

/// Remote-command channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host implementation name (registered in the backend registry)
    #[serde(default = "default_remote_type")]
    pub remote_type: String,

    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key used for authentication (agent/default keys when unset)
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound for any single remote command (seconds)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl SshConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.connect_timeout_secs == 0 || self.command_timeout_secs == 0 {
            return Err(crate::Error::config("SSH timeouts must be > 0"));
        }
        if self.user.is_empty() {
            return Err(crate::Error::config("SSH user cannot be empty"));
        }
        Ok(())
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            remote_type: default_remote_type(),
            host: String::new(),
            port: default_ssh_port(),
            user: default_ssh_user(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    48 * 60 * 60
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_config_dir() -> String {
    "/etc/squid/includes".to_string()
}

fn default_backup_suffix() -> String {
    ".bak".to_string()
}

fn default_acl_file() -> String {
    "acls_users_ports.conf".to_string()
}

fn default_validate_command() -> String {
    "squid -k parse".to_string()
}

fn default_reconfigure_command() -> String {
    "squid -k reconfigure".to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_type() -> String {
    "http".to_string()
}

fn default_verifier_url() -> String {
    "https://ipv4.icanhazip.com".to_string()
}

fn default_verifier_attempts() -> usize {
    3
}

fn default_verifier_retry_delay_secs() -> u64 {
    5
}

fn default_verifier_timeout_secs() -> u64 {
    5
}

fn default_remote_type() -> String {
    "ssh".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    30
}
