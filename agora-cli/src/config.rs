//! Persistent configuration for agora-cli.
//!
//! Config file lives at `~/.config/agora/cli.toml`.
//! Session state (the token pair) at `~/.config/agora/session.toml`,
//! owned by the SDK's credential store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default service endpoints for a local deployment.
pub const DEFAULT_AUTH_URL: &str = "http://localhost:8081";
pub const DEFAULT_FORUM_URL: &str = "http://localhost:8082";
pub const DEFAULT_CHAT_URL: &str = "http://localhost:8083";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8083/api/chat/ws";

/// User configuration (persisted in cli.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Auth service base URL.
    pub auth_url: Option<String>,
    /// Forum service base URL.
    pub forum_url: Option<String>,
    /// Chat service base URL (REST history endpoint).
    pub chat_url: Option<String>,
    /// Chat WebSocket endpoint.
    pub ws_url: Option<String>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agora")
}

fn config_path() -> PathBuf {
    config_dir().join("cli.toml")
}

pub fn session_path() -> PathBuf {
    config_dir().join("session.toml")
}

impl Config {
    pub fn load() -> Self {
        let path = config_path();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => return c,
                    Err(e) => eprintln!("Warning: bad config file {}: {e}", path.display()),
                },
                Err(e) => eprintln!("Warning: can't read {}: {e}", path.display()),
            }
        }
        Self::default()
    }

    pub fn save(&self) {
        let path = config_path();
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match toml::to_string_pretty(self) {
            Ok(s) => {
                if let Err(e) = std::fs::write(&path, s) {
                    eprintln!("Warning: can't save config: {e}");
                }
            }
            Err(e) => eprintln!("Warning: can't serialize config: {e}"),
        }
    }
}

/// Effective endpoints after merging CLI args > config file > defaults.
pub struct Resolved {
    pub auth_url: String,
    pub forum_url: String,
    pub chat_url: String,
    pub ws_url: String,
}

impl Resolved {
    pub fn merge(cli: &super::Cli, config: &Config) -> Self {
        Self {
            auth_url: cli
                .auth_url
                .clone()
                .or_else(|| config.auth_url.clone())
                .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            forum_url: cli
                .forum_url
                .clone()
                .or_else(|| config.forum_url.clone())
                .unwrap_or_else(|| DEFAULT_FORUM_URL.to_string()),
            chat_url: cli
                .chat_url
                .clone()
                .or_else(|| config.chat_url.clone())
                .unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            ws_url: cli
                .ws_url
                .clone()
                .or_else(|| config.ws_url.clone())
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
        }
    }
}
