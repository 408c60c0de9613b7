//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `WALLETGATE_LISTEN`,
//!    `WALLETGATE_AUTHORIZED_ADDRESSES` (comma-separated),
//!    `WALLETGATE_LOG_LEVEL`
//! 2. **Config file** — path via `--config <path>`, or `walletgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3001"
//! allowed_origins = ["http://localhost:3000"]
//! connect_timeout_secs = 30
//! close_timeout_secs = 5
//! default_terminal_rows = 24
//! default_terminal_cols = 80
//!
//! [auth]
//! authorized_addresses = ["0x9431Cf5DA0CE60664661341db650763B08286B18"]
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML. Immutable for the
/// process lifetime once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and session-lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3001`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// CORS origin allow-list. Empty means any origin, which is warned about
    /// at startup.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Timeout for establishing a backend connection, in seconds (default 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Bounded wait for a backend to confirm close before it is forcibly
    /// dropped, in seconds (default 5).
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    /// Terminal rows requested for shell sessions when the client doesn't
    /// specify (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Terminal columns requested for shell sessions when the client doesn't
    /// specify (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
}

/// Authorization settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Wallet addresses permitted to authenticate. Empty list means any
    /// address with a valid signature is accepted (open mode).
    #[serde(default)]
    pub authorized_addresses: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_close_timeout_secs() -> u64 {
    5
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            allowed_origins: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — malformed
    /// startup configuration is fatal before any connection is accepted).
    /// Otherwise looks for `walletgate.toml` in the current directory,
    /// falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("walletgate.toml").exists() {
            let content =
                std::fs::read_to_string("walletgate.toml").expect("Failed to read walletgate.toml");
            toml::from_str(&content).expect("Failed to parse walletgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("WALLETGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(addresses) = std::env::var("WALLETGATE_AUTHORIZED_ADDRESSES") {
            config.auth.authorized_addresses = addresses
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Ok(level) = std::env::var("WALLETGATE_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:3001");
        assert_eq!(config.server.close_timeout_secs, 5);
        assert_eq!(config.server.connect_timeout_secs, 30);
        assert!(config.auth.authorized_addresses.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            allowed_origins = ["https://app.example.com"]
            close_timeout_secs = 2

            [auth]
            authorized_addresses = ["0xABC0000000000000000000000000000000000001"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.allowed_origins.len(), 1);
        assert_eq!(config.server.close_timeout_secs, 2);
        assert_eq!(config.auth.authorized_addresses.len(), 1);
        // Untouched sections keep their defaults
        assert_eq!(config.server.default_terminal_rows, 24);
        assert_eq!(config.logging.level, "info");
    }
}
