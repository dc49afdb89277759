//! # devpulse-server
//!
//! Relay server for DevPulse profile sync.
//!
//! This binary provides:
//! - **Encrypted content storage**: diffs and stars arrive as opaque
//!   ciphertext and are stored without ever being decrypted
//! - **Transport-hash authentication** with per-profile brute-force lockout
//! - **Hash-based staleness polling** so idle clients exchange digests, not
//!   content
//! - **Public diff reads** for digests their owner explicitly shared
//! - **Per-IP rate limiting**

mod api;
mod auth;
mod config;
mod error;
mod rate_limit;
mod storage;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,devpulse_server=debug")),
        )
        .init();

    info!("Starting DevPulse relay server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let storage = Arc::new(
        Storage::open(&config.database_path, config.max_diffs_retained)
            .map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?,
    );

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    // Evict idle rate-limit buckets every 5 minutes.
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    let http_addr = config.http_addr;
    let state = AppState {
        storage,
        rate_limiter,
        config: Arc::new(config),
    };

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
