//! Configuration management for the control plane
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Persistent store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => anyhow::bail!("unknown store backend: {} (expected memory/redis)", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    pub store_backend: StoreBackend,

    /// Redis connection URL, used by the redis backend
    pub redis_url: String,

    /// Scheduler tick period in milliseconds
    pub tick_interval_ms: u64,

    /// Seed for reproducible simulations; entropy when unset
    pub simulation_seed: Option<u64>,

    /// Log stream poll cadence in milliseconds
    pub stream_poll_ms: u64,

    /// Bootstrap admin created at startup
    pub root_username: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            api_host: var("API_HOST", "0.0.0.0"),

            api_port: var("API_PORT", "8090")
                .parse()
                .context("Invalid API_PORT")?,

            store_backend: var("STORE_BACKEND", "memory")
                .parse()
                .context("Invalid STORE_BACKEND")?,

            redis_url: var("REDIS_URL", "redis://127.0.0.1:6379"),

            tick_interval_ms: var("TICK_INTERVAL_MS", "1000")
                .parse()
                .context("Invalid TICK_INTERVAL_MS")?,

            simulation_seed: lookup("SIMULATION_SEED")
                .map(|seed| seed.parse::<u64>())
                .transpose()
                .context("Invalid SIMULATION_SEED")?,

            stream_poll_ms: var("STREAM_POLL_MS", "1000")
                .parse()
                .context("Invalid STREAM_POLL_MS")?,

            root_username: var("ROOT_USERNAME", "root"),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.tick_interval_ms == 0 {
            anyhow::bail!("TICK_INTERVAL_MS must be greater than 0");
        }

        if self.stream_poll_ms == 0 {
            anyhow::bail!("STREAM_POLL_MS must be greater than 0");
        }

        if self.root_username.trim().is_empty() {
            anyhow::bail!("ROOT_USERNAME must not be empty");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }
}
