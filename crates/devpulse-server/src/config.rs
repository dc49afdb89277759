//! Server configuration from environment variables.
//!
//! Everything defaults so a bare `devpulse-server` starts up for local
//! development with a database file next to the binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use devpulse_shared::constants::{DEFAULT_HTTP_PORT, MAX_DIFFS_RETAINED};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`, default `0.0.0.0:8080`.
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`, default `./devpulse.db`.
    pub database_path: PathBuf,

    /// Newest diffs retained per profile.
    /// Env: `MAX_DIFFS_RETAINED`, default 50.
    pub max_diffs_retained: usize,

    /// Rate limiter: sustained requests per second per IP.
    /// Env: `RATE_LIMIT_PER_SEC`, default 10.
    pub rate_limit_per_sec: f64,

    /// Rate limiter: burst capacity per IP.
    /// Env: `RATE_LIMIT_BURST`, default 30.
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./devpulse.db"),
            max_diffs_retained: MAX_DIFFS_RETAINED,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("MAX_DIFFS_RETAINED") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_diffs_retained = n;
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_PER_SEC") {
            if let Ok(n) = val.parse::<f64>() {
                config.rate_limit_per_sec = n;
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_BURST") {
            if let Ok(n) = val.parse::<f64>() {
                config.rate_limit_burst = n;
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}
