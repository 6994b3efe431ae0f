use serde::Deserialize;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Agent configuration, read once from `config.json` at startup and owned by
/// the session for its lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// WebSocket URL of the controller, e.g. `wss://ctrl.example/ws`.
    pub location: String,
    /// Identity this agent presents when subscribing for new commands.
    pub server_id: String,
    /// Accept any certificate the controller presents. This defeats
    /// transport authentication; it is an explicit opt-in for controllers
    /// that cannot be provisioned with a verifiable certificate.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(#[from] io::Error),
    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
