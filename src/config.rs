//! Host and engine configuration
//!
//! `HostConfig` is an immutable snapshot owned by the host catalog; the
//! engine reads it fresh on every connection attempt and never mutates it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a host in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of connection a host expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Interactive shell session
    Shell,
    /// File transfer session (listing, upload, download)
    FileTransfer,
    /// Raw byte stream (no shell semantics)
    RawStream,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// Key authentication with an on-disk private key
    KeyFile {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// Key authentication with inline key material (e.g. pulled from a
    /// keychain). Requires materialization to a temp path at connect time.
    KeyData {
        key_data: String,
        passphrase: Option<String>,
    },

    /// Agent-based authentication
    Agent,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key_file(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::KeyFile {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn key_data(key_data: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::KeyData {
            key_data: key_data.into(),
            passphrase,
        }
    }
}

/// Retry policy for a single host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of reconnection attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first backoff wait (ms)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts (ms)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether to reconnect automatically on failure
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            auto_reconnect: true,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Configuration for a single host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Catalog identifier
    pub id: HostId,

    /// Display name (auto-generated if not provided)
    #[serde(default)]
    pub label: Option<String>,

    /// Target hostname or IP
    pub host: String,

    /// Remote port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Connection kind
    pub kind: ConnectionKind,

    /// Authentication method
    pub auth: AuthMethod,

    /// Ordered jump-host identifiers, excluding this host itself
    #[serde(default)]
    pub chain: Vec<HostId>,

    /// Keepalive probe interval (ms)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_ms: u64,

    /// Retry policy for this host
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Optional working directory hint for the opened session
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl HostConfig {
    /// Get display name (or generate from config)
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.username, self.host))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Engine-wide policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePolicy {
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Whether an authentication rejection is retried like a network
    /// failure. Credentials may be transiently unavailable (agent not yet
    /// unlocked), so the default is to retry within the attempt budget.
    #[serde(default = "default_true")]
    pub retry_on_auth_rejection: bool,

    /// Maximum time a reconnect loop waits for the network to come back
    /// before giving up on the episode (ms)
    #[serde(default = "default_offline_wait")]
    pub offline_wait_ms: u64,

    /// Timeout for a single connect attempt (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            retry_on_auth_rejection: true,
            offline_wait_ms: 120_000,
            connect_timeout_ms: 30_000,
        }
    }
}

impl EnginePolicy {
    pub fn offline_wait(&self) -> Duration {
        Duration::from_millis(self.offline_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_port() -> u16 {
    22
}

fn default_keepalive() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    20
}

fn default_offline_wait() -> u64 {
    120_000
}

fn default_connect_timeout() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_user_at_host() {
        let config = HostConfig {
            id: "h1".into(),
            label: None,
            host: "example.com".to_string(),
            port: 22,
            username: "user".to_string(),
            kind: ConnectionKind::Shell,
            auth: AuthMethod::Agent,
            chain: vec![],
            keepalive_interval_ms: 30_000,
            retry: RetryPolicy::default(),
            working_dir: None,
        };
        assert_eq!(config.display_name(), "user@example.com");
    }

    #[test]
    fn host_config_deserializes_with_defaults() {
        let json = r#"{
            "id": "h1",
            "host": "example.com",
            "username": "user",
            "kind": "shell",
            "auth": { "type": "agent" }
        }"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 22);
        assert!(config.chain.is_empty());
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.retry.auto_reconnect);
    }

    #[test]
    fn auth_method_tagged_representation() {
        let auth = AuthMethod::key_file("/home/user/.ssh/id_ed25519", None);
        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains("\"type\":\"key_file\""));
    }
}
