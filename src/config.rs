//! Call subsystem configuration.
//!
//! Loaded from environment variables with defaults that work against the
//! public Google STUN servers.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::utils::add_ice_url_scheme;

/// How long an outbound channel may take to confirm its subscription.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the `CallEvent` broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One ICE server entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub subscribe_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl CallConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// - `SSC_ICE_URLS`: comma-separated URLs; `turn:`/`turns:` entries are TURN servers
    /// - `SSC_TURN_USERNAME` / `SSC_TURN_CREDENTIAL`: credentials for every TURN entry
    /// - `SSC_SUBSCRIBE_TIMEOUT_MS`: outbound subscription timeout
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = CallConfig::default();

        if let Some(urls) = vars.get("SSC_ICE_URLS") {
            let username = vars.get("SSC_TURN_USERNAME").cloned();
            let credential = vars.get("SSC_TURN_CREDENTIAL").cloned();
            config.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .enumerate()
                .map(|(i, url)| {
                    let kind = if url.starts_with("turn") {
                        IceServerKind::Turn
                    } else {
                        IceServerKind::Stun
                    };
                    let (username, credential) = match kind {
                        IceServerKind::Turn => (username.clone(), credential.clone()),
                        IceServerKind::Stun => (None, None),
                    };
                    ServerConfig {
                        id: format!("env-{i}"),
                        kind,
                        url: url.to_string(),
                        username,
                        credential,
                    }
                })
                .collect();
        }

        if let Some(raw) = vars.get("SSC_SUBSCRIBE_TIMEOUT_MS") {
            let ms: u64 = raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("SSC_SUBSCRIBE_TIMEOUT_MS={raw}"))
            })?;
            config.subscribe_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject empty URLs, TURN entries without credentials and a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "ICE server {} has an empty URL",
                    server.id
                )));
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::InvalidValue(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.subscribe_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "subscribe timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![add_ice_url_scheme(server)],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}
