// Client configuration.
//
// Mirrors the relay's environment-driven config: every value has a default
// suitable for a relay running locally.

use std::time::Duration;

use scrumflow_common::protocol::realtime::CURRENT_PROTOCOL_VERSION;
use scrumflow_common::types::PRESENCE_FRESHNESS_WINDOW_SECS;
use url::Url;

use crate::transport::TransportError;

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL (`http://` or `https://`).
    pub relay_url: String,
    /// Cursor, selection and presence entries older than this are swept.
    pub freshness_window: Duration,
    pub reaper_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            freshness_window: Duration::from_secs(PRESENCE_FRESHNESS_WINDOW_SECS as u64),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
        }
    }
}

impl ClientConfig {
    /// | Variable | Default |
    /// |---|---|
    /// | `SCRUMFLOW_RELAY_URL` | `http://127.0.0.1:8080` |
    /// | `SCRUMFLOW_CLIENT_FRESHNESS_WINDOW_SECS` | `300` |
    /// | `SCRUMFLOW_CLIENT_REAPER_INTERVAL_SECS` | `60` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();
        let relay_url = env("SCRUMFLOW_RELAY_URL")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(defaults.relay_url);
        let freshness_window = positive_secs(&env, "SCRUMFLOW_CLIENT_FRESHNESS_WINDOW_SECS")
            .unwrap_or(defaults.freshness_window);
        let reaper_interval = positive_secs(&env, "SCRUMFLOW_CLIENT_REAPER_INTERVAL_SECS")
            .unwrap_or(defaults.reaper_interval);

        Self { relay_url, freshness_window, reaper_interval }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = relay_url.into();
        self
    }

    /// The `/v1/realtime` WebSocket URL, with the protocol version pinned.
    pub fn realtime_url(&self) -> Result<Url, TransportError> {
        let mut url = self.base_url()?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "relay url must use http or https, got `{other}`"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
        url.set_path("/v1/realtime");
        url.query_pairs_mut().clear().append_pair("vsn", CURRENT_PROTOCOL_VERSION);
        Ok(url)
    }

    /// The session-action endpoint.
    pub fn rpc_url(&self) -> Result<Url, TransportError> {
        let mut url = self.base_url()?;
        url.set_path("/v1/collaboration");
        Ok(url)
    }

    fn base_url(&self) -> Result<Url, TransportError> {
        Url::parse(&self.relay_url)
            .map_err(|error| TransportError::InvalidUrl(format!("{}: {error}", self.relay_url)))
    }
}

fn positive_secs<F>(env: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|value| value.parse::<u64>().ok()).filter(|secs| *secs > 0).map(Duration::from_secs)
}
