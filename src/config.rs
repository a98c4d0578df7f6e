// Configuration File Support
//
// This module provides configuration file parsing for the MCP runtime.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/mcp-runtime/config.toml

use crate::mcp::circuit_breaker::CircuitBreakerConfig;
use crate::mcp::pool::{ConnectionFactory, PoolConfig};
use crate::mcp::{HttpTransport, McpClient, SseTransport, StdioTransport, Transport};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// MCP server configurations, keyed by logical server name
    pub servers: HashMap<String, ServerConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// How a server is reached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    Http,
}

/// MCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport type (stdio, sse, http)
    pub transport: TransportKind,

    /// Command to spawn the MCP server (stdio only, e.g. "npx")
    pub command: String,

    /// Arguments for the MCP server
    pub args: Vec<String>,

    /// Working directory for the server process
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for the server process
    pub env: HashMap<String, String>,

    /// Base URL (sse and http)
    pub url: Option<String>,

    /// Extra HTTP headers, e.g. Authorization (sse and http)
    pub headers: HashMap<String, String>,

    /// Timeout in seconds for MCP requests
    pub timeout_secs: u64,

    /// HTTP attempts per request, including the first
    pub max_retries: usize,

    /// Base HTTP retry delay in milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,

    /// Delay before the SSE listener reconnects
    pub reconnect_interval_secs: u64,

    /// Connection pool settings
    pub pool: PoolSettings,

    /// Circuit breaker settings
    pub circuit_breaker: BreakerSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-filesystem".to_string(),
                "/tmp".to_string(),
            ],
            cwd: None,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 1000,
            reconnect_interval_secs: 5,
            pool: PoolSettings::default(),
            circuit_breaker: BreakerSettings::default(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connection_timeout_secs: 30,
            idle_timeout_secs: 300,
            health_check_interval_secs: 60,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min_connections: settings.min_connections,
            max_connections: settings.max_connections,
            connection_timeout: Duration::from_secs(settings.connection_timeout_secs),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            health_check_interval: Duration::from_secs(settings.health_check_interval_secs),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            success_threshold: 2,
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_secs_f64(settings.recovery_timeout_secs.max(0.0)),
            success_threshold: settings.success_threshold,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from(&self.pool)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from(&self.circuit_breaker)
    }

    /// Build an unconnected transport for this server
    pub fn build_transport(&self) -> crate::mcp::Result<Box<dyn Transport>> {
        let transport: Box<dyn Transport> = match self.transport {
            TransportKind::Stdio => {
                let mut transport = StdioTransport::new(&self.command, &self.args)
                    .with_timeout(self.timeout())
                    .with_env(self.env.clone());
                if let Some(cwd) = &self.cwd {
                    transport = transport.with_cwd(cwd);
                }
                Box::new(transport)
            }
            TransportKind::Sse => Box::new(
                SseTransport::new(self.require_url()?)
                    .with_headers(self.headers.clone())
                    .with_timeout(self.timeout())
                    .with_reconnect_interval(Duration::from_secs(self.reconnect_interval_secs)),
            ),
            TransportKind::Http => Box::new(
                HttpTransport::new(self.require_url()?)
                    .with_headers(self.headers.clone())
                    .with_timeout(self.timeout())
                    .with_retry(self.max_retries, Duration::from_millis(self.retry_backoff_ms)),
            ),
        };
        Ok(transport)
    }

    fn require_url(&self) -> crate::mcp::Result<&str> {
        self.url
            .as_deref()
            .ok_or_else(|| crate::mcp::McpError::connection("Server has no URL configured"))
    }

    /// Factory handing the pool a fresh, initialized client per call
    pub fn connection_factory(&self) -> ConnectionFactory<McpClient> {
        let server = self.clone();
        Arc::new(move || -> BoxFuture<'static, crate::mcp::Result<McpClient>> {
            let server = server.clone();
            Box::pin(async move {
                let transport = server.build_transport()?;
                let client = McpClient::new();
                client
                    .connect_transport(transport, Some(server.timeout()))
                    .await?;
                Ok(client)
            })
        })
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the defaults (env overrides
    /// still apply).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/mcp-runtime/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "mcp-runtime") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("mcp-runtime")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - MCP_RUNTIME_LOG_LEVEL
    /// - MCP_RUNTIME_LOG_FORMAT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("MCP_RUNTIME_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MCP_RUNTIME_LOG_FORMAT") {
            self.logging.format = format;
        }
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        for (name, server) in &self.servers {
            match server.transport {
                TransportKind::Stdio if server.command.is_empty() => {
                    anyhow::bail!("MCP server '{}' has empty command", name)
                }
                TransportKind::Sse | TransportKind::Http if server.url.is_none() => {
                    anyhow::bail!(
                        "MCP server '{}' uses {:?} transport but has no URL configured",
                        name,
                        server.transport
                    )
                }
                _ => {}
            }
            if server.transport == TransportKind::Http && server.max_retries == 0 {
                anyhow::bail!(
                    "MCP server '{}': max_retries must be >= 1 (it counts total attempts)",
                    name
                );
            }

            let pool = &server.pool;
            if pool.max_connections == 0 {
                anyhow::bail!("MCP server '{}': max_connections must be > 0", name);
            }
            if pool.min_connections > pool.max_connections {
                anyhow::bail!(
                    "MCP server '{}': min_connections ({}) exceeds max_connections ({})",
                    name,
                    pool.min_connections,
                    pool.max_connections
                );
            }

            let breaker = &server.circuit_breaker;
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                anyhow::bail!("MCP server '{}': circuit breaker thresholds must be > 0", name);
            }
            if !breaker.recovery_timeout_secs.is_finite() || breaker.recovery_timeout_secs < 0.0 {
                anyhow::bail!("MCP server '{}': invalid recovery timeout", name);
            }
        }

        Ok(())
    }

    /// Look up a server by name
    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.servers.keys().map(String::as_str).collect();
            known.sort_unstable();
            anyhow::anyhow!(
                "Unknown MCP server '{}'. Configured servers: [{}]",
                name,
                known.join(", ")
            )
        })
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
