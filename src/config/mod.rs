//! Application configuration management

use std::env;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// SQLite database path
    pub database_path: String,

    /// Sync engine polling interval in milliseconds
    pub sync_interval_ms: u64,

    /// WebSocket heartbeat sweep period in seconds
    pub ws_heartbeat_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("Invalid PORT")?,

            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/qbdeck.db".to_string()),

            sync_interval_ms: env::var("SYNC_INTERVAL_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Invalid SYNC_INTERVAL_MS")?,

            ws_heartbeat_secs: env::var("WS_HEARTBEAT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid WS_HEARTBEAT_SECS")?,
        })
    }
}
