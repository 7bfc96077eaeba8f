//! Connection configuration and websocket URL derivation.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::TransportError;

const DEFAULT_API_VERSION: &str = "/api/v4";

/// Where and how to reach the server's websocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Public site URL (`https://chat.example.com`)
    pub site_url: String,
    /// Explicit websocket URL; overrides everything derived from `site_url`
    pub websocket_url: Option<String>,
    pub websocket_port: u16,
    pub websocket_secure_port: u16,
    pub api_version: String,
    /// Session token, sent as `Authorization: Bearer <token>`
    pub token: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            site_url: "http://localhost:8065".to_string(),
            websocket_url: None,
            websocket_port: 80,
            websocket_secure_port: 443,
            api_version: DEFAULT_API_VERSION.to_string(),
            token: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(site_url: impl Into<String>) -> Self {
        Self {
            site_url: site_url.into(),
            ..Default::default()
        }
    }

    /// Full websocket endpoint, e.g. `wss://chat.example.com/api/v4/websocket`.
    ///
    /// Ports that are the default for the websocket scheme are elided, the
    /// way any WHATWG URL serializer writes them.
    pub fn connection_url(&self) -> Result<String, TransportError> {
        let explicit = self
            .websocket_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let mut url = match explicit {
            Some(explicit) => explicit.to_string(),
            None => self.derive_from_site_url()?,
        };

        if url.ends_with('/') {
            url.pop();
        }

        url.push_str(&self.api_version);
        url.push_str("/websocket");
        Ok(url)
    }

    fn derive_from_site_url(&self) -> Result<String, TransportError> {
        let invalid = |reason: &dyn std::fmt::Display| {
            TransportError::InvalidUrl(format!("{}: {reason}", self.site_url))
        };

        let mut url = Url::parse(self.site_url.trim()).map_err(|e| invalid(&e))?;
        let (scheme, port) = match url.scheme() {
            "https" | "wss" => ("wss", self.websocket_secure_port),
            _ => ("ws", self.websocket_port),
        };

        url.set_scheme(scheme)
            .map_err(|()| invalid(&format!("cannot switch `{}` to {scheme}", url.scheme())))?;
        if url.port().is_none() {
            url.set_port(Some(port))
                .map_err(|()| invalid(&"site URL has no host"))?;
        }
        url.set_query(None);
        url.set_fragment(None);

        Ok(url.into())
    }
}

/// Reconnect and health-check tuning for `WsTransport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A connection with no inbound traffic for this long is dropped and retried
    pub stale_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
        }
    }
}
