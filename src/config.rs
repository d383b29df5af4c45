//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (for deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_RELAY__CLOSE_GRACE_MS`, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The HTTP server and the relay have unrelated tunables; grouping them keeps
/// `config.toml` readable (`[server]` and `[relay]` tables).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Session relay tuning.
///
/// ## Fields:
/// - `close_grace_ms`: How long a closed session lingers before its id becomes reusable
/// - `max_payload_bytes`: Largest audio chunk that will be forwarded
/// - `heartbeat_interval_secs`: How often the server pings each WebSocket
/// - `client_timeout_secs`: Silence after which a connection is treated as disconnected
/// - `mailbox_capacity`: Outbound messages queued per connection before new ones are dropped
/// - `max_connections`: Upgrade requests beyond this are refused with 503
/// - `strict_join`: Reject `join-session` on unknown ids instead of creating the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub close_grace_ms: u64,
    pub max_payload_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub mailbox_capacity: usize,
    pub max_connections: usize,
    pub strict_join: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            close_grace_ms: 5_000,                 // Long enough for in-flight chunks to drain
            max_payload_bytes: 5 * 1024 * 1024,    // 5 MiB per chunk
            heartbeat_interval_secs: 15,
            client_timeout_secs: 45,
            mailbox_capacity: 256,                 // ~5s of 20ms audio frames
            max_connections: 512,
            strict_join: false,
        }
    }
}

/// Provides default configuration values.
///
/// Defaults let the server start with no config file at all and document
/// reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,                     // Common development port
            },
            relay: RelayConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with `APP_`
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_RELAY__MAX_PAYLOAD_BYTES=1048576`: Lower the chunk ceiling
    /// - `APP_RELAY__STRICT_JOIN=true`: Refuse joins on unknown sessions
    ///
    /// Nested keys use a double underscore because field names already contain single ones.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The payload ceiling and mailbox can hold at least something
    /// - The client timeout is longer than the heartbeat interval, otherwise every
    ///   connection would time out between two pings
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_payload_bytes == 0 {
            return Err(anyhow::anyhow!("Max payload bytes must be greater than 0"));
        }

        if self.relay.mailbox_capacity == 0 {
            return Err(anyhow::anyhow!("Mailbox capacity must be greater than 0"));
        }

        if self.relay.max_connections == 0 {
            return Err(anyhow::anyhow!("Max connections must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.relay.client_timeout_secs,
                self.relay.heartbeat_interval_secs
            ));
        }

        Ok(())
    }
}
