//! CLI settings: flags and env vars layered over an optional TOML file.
//!
//! ```toml
//! user_id = "u1"
//! scopes = ["team:T1"]
//! resubscribe_on_reconnect = true
//!
//! [connection]
//! site_url = "https://chat.example.com"
//! token = "..."
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Args;
use huddle_realtime::ConnectionConfig;
use serde::Deserialize;

use crate::paths;

/// Connection flags shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// Site URL the websocket address is derived from
    #[arg(long, global = true, env = "HUDDLE_SITE_URL")]
    pub site_url: Option<String>,

    /// Explicit websocket URL (skips derivation from the site URL)
    #[arg(long, global = true, env = "HUDDLE_WEBSOCKET_URL")]
    pub websocket_url: Option<String>,

    /// Session token
    #[arg(long, global = true, env = "HUDDLE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// User to log in as
    #[arg(long, global = true, env = "HUDDLE_USER_ID")]
    pub user_id: Option<String>,

    /// Scope to subscribe to (repeatable)
    #[arg(long = "scope", global = true)]
    pub scopes: Vec<String>,

    /// Re-send scope subscriptions after a reconnect
    #[arg(long, global = true)]
    pub resubscribe: bool,

    /// Print envelopes as JSON lines
    #[arg(long, global = true)]
    pub json: bool,
}

/// On-disk configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub connection: ConnectionConfig,
    pub user_id: Option<String>,
    pub scopes: Vec<String>,
    pub resubscribe_on_reconnect: bool,
}

/// Resolved settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub resubscribe_on_reconnect: bool,
    pub json_output: bool,
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

/// `--config` must exist; the default location is optional.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<FileConfig> {
    if let Some(path) = explicit {
        return load_file(path);
    }
    let default: PathBuf = paths::config_path();
    if default.is_file() {
        load_file(&default)
    } else {
        Ok(FileConfig::default())
    }
}

impl Settings {
    /// Flags and env vars override the file; the file overrides defaults.
    pub fn resolve(args: &ConnectionArgs, file: FileConfig) -> anyhow::Result<Self> {
        let mut connection = file.connection;
        if let Some(site_url) = &args.site_url {
            connection.site_url = site_url.clone();
        }
        if let Some(websocket_url) = &args.websocket_url {
            connection.websocket_url = Some(websocket_url.clone());
        }
        if let Some(token) = &args.token {
            connection.token = Some(token.clone());
        }

        let scopes = if args.scopes.is_empty() {
            file.scopes
        } else {
            args.scopes.clone()
        };

        Ok(Self {
            connection,
            user_id: args
                .user_id
                .clone()
                .or(file.user_id)
                .unwrap_or_default(),
            scopes,
            resubscribe_on_reconnect: args.resubscribe || file.resubscribe_on_reconnect,
            json_output: args.json,
        })
    }

    /// Listening needs an identity; without one the manager never connects.
    pub fn require_user(&self) -> anyhow::Result<&str> {
        let user_id = self.user_id.trim();
        if user_id.is_empty() {
            bail!("no user id configured (use --user-id, HUDDLE_USER_ID or `user_id` in the config file)");
        }
        Ok(user_id)
    }
}
