//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the engine can start with zero
//! configuration against a local development server.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_net::ConnectionConfig;
use courier_shared::constants::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_LIVENESS_MISSED_HEARTBEATS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_SECS, DEFAULT_SERVER_URL,
};
use courier_shared::types::UserId;
use courier_store::{Database, StoreError};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint of the message server.
    /// Env: `COURIER_SERVER_URL`
    pub server_url: String,

    /// Session credential issued by the auth service, sent as a bearer token.
    /// Env: `COURIER_TOKEN`
    /// Default: none.
    pub token: Option<String>,

    /// Id of the signed-in user.
    /// Env: `COURIER_USER_ID`
    /// Default: `0`
    pub user_id: UserId,

    /// Explicit ledger location.
    /// Env: `COURIER_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Env: `COURIER_HEARTBEAT_SECS`
    pub heartbeat_secs: u64,

    /// Silent heartbeat intervals before the link is dropped (0 = never).
    /// Env: `COURIER_LIVENESS_MISSED`
    pub liveness_missed: u32,

    /// Env: `COURIER_RECONNECT_BASE_MS`
    pub reconnect_base_ms: u64,

    /// Env: `COURIER_RECONNECT_MAX_SECS`
    pub reconnect_max_secs: u64,

    /// Env: `COURIER_MAX_RECONNECT_ATTEMPTS`
    pub max_reconnect_attempts: u32,

    /// Periodic sync while connected (0 = only on connect).
    /// Env: `COURIER_SYNC_INTERVAL_SECS`
    pub sync_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token: None,
            user_id: UserId(0),
            db_path: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            liveness_missed: DEFAULT_LIVENESS_MISSED_HEARTBEATS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_secs: DEFAULT_RECONNECT_MAX_SECS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            sync_interval_secs: 0,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("COURIER_SERVER_URL") {
            if !url.is_empty() {
                config.server_url = url;
            }
        }

        if let Some(token) = lookup("COURIER_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }

        if let Some(path) = lookup("COURIER_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(id) = parse_var::<i64>(&lookup, "COURIER_USER_ID") {
            config.user_id = UserId(id);
        }
        if let Some(v) = parse_var(&lookup, "COURIER_HEARTBEAT_SECS") {
            config.heartbeat_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "COURIER_LIVENESS_MISSED") {
            config.liveness_missed = v;
        }
        if let Some(v) = parse_var(&lookup, "COURIER_RECONNECT_BASE_MS") {
            config.reconnect_base_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "COURIER_RECONNECT_MAX_SECS") {
            config.reconnect_max_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "COURIER_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "COURIER_SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = v;
        }

        config
    }

    /// Timing settings for the connection manager.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            liveness_missed: self.liveness_missed,
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    /// Open the ledger at `db_path`, or in the platform data directory.
    pub fn open_database(&self) -> Result<Database, StoreError> {
        match &self.db_path {
            Some(path) => Database::open_at(path),
            None => Database::new(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
