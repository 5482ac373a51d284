// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own `SCRUMFLOW_RELAY_DB_*` variables.

use std::net::SocketAddr;

use scrumflow_common::types::PRESENCE_FRESHNESS_WINDOW_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `scrumflow_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Presence rows older than this are not reported as active.
    pub presence_window: chrono::Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SCRUMFLOW_RELAY_HOST` | `0.0.0.0` |
    /// | `SCRUMFLOW_RELAY_PORT` | `8080` |
    /// | `SCRUMFLOW_RELAY_DATABASE_URL` | *(none: in-memory store)* |
    /// | `SCRUMFLOW_RELAY_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `SCRUMFLOW_RELAY_LOG_FILTER` | `info` |
    /// | `SCRUMFLOW_RELAY_LOG_FORMAT` | `text` |
    /// | `SCRUMFLOW_RELAY_PRESENCE_WINDOW_SECS` | `300` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("SCRUMFLOW_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("SCRUMFLOW_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url =
            env("SCRUMFLOW_RELAY_DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        let cors_origins = env("SCRUMFLOW_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("SCRUMFLOW_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("SCRUMFLOW_RELAY_LOG_FORMAT").as_deref() {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let presence_window_secs = env("SCRUMFLOW_RELAY_PRESENCE_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(PRESENCE_FRESHNESS_WINDOW_SECS);

        Self {
            listen_addr,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            presence_window: chrono::Duration::seconds(presence_window_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.database_url.is_none());
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.presence_window, chrono::Duration::minutes(5));
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_HOST", "127.0.0.1");
        m.insert("SCRUMFLOW_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn database_url_from_env() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_DATABASE_URL", "postgres://u:p@host/db?sslmode=require");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db?sslmode=require"));
    }

    #[test]
    fn blank_database_url_selects_memory_store() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_DATABASE_URL", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_LOG_FORMAT", "JSON");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn presence_window_override_rejects_non_positive_values() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_PRESENCE_WINDOW_SECS", "120");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.presence_window, chrono::Duration::seconds(120));

        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_PRESENCE_WINDOW_SECS", "0");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.presence_window, chrono::Duration::minutes(5));
    }

    #[test]
    fn log_filter_override() {
        let mut m = HashMap::new();
        m.insert("SCRUMFLOW_RELAY_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
