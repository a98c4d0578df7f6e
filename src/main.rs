// MCP Runtime - Diagnostic Entry Point
//
// Exercises the runtime end to end against configured servers:
// - list tools
// - call a tool
// - report pool and circuit breaker status
//
// Every command acquires its client through the server's Circuit Breaker and
// Connection Pool, exactly like an embedding application would.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_runtime::config::{Config, ServerConfig};
use mcp_runtime::mcp::{CircuitBreaker, ConnectionPool, McpClient};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// MCP Runtime: Model Context Protocol client diagnostics
#[derive(Parser, Debug)]
#[command(name = "mcp-runtime")]
#[command(version)]
#[command(about = "Discover and invoke tools on MCP servers", long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/mcp-runtime/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the tools a server exposes
    ListTools {
        /// Server name from the configuration
        server: String,
    },
    /// Invoke a tool and print its result
    CallTool {
        /// Server name from the configuration
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Call timeout in seconds (default: the server's timeout)
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Check connectivity and print pool and breaker metrics
    Status {
        /// Server name from the configuration
        server: String,
    },
}

/// Pool and breaker guarding one server for the lifetime of a command
struct Session {
    pool: ConnectionPool<McpClient>,
    breaker: CircuitBreaker,
}

impl Session {
    async fn open(name: &str, server: &ServerConfig) -> Self {
        let pool = ConnectionPool::new(name, server.pool_config(), server.connection_factory()).await;
        let breaker = CircuitBreaker::new(name, server.breaker_config());
        Self { pool, breaker }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;

    info!("MCP runtime v{} starting...", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::ListTools { server } => list_tools(&config, &server).await,
        Commands::CallTool {
            server,
            tool,
            args,
            timeout,
        } => call_tool(&config, &server, &tool, &args, timeout).await,
        Commands::Status { server } => status(&config, &server).await,
    }
}

/// Initialize tracing from config, `--verbose` and `RUST_LOG`
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn list_tools(config: &Config, name: &str) -> Result<()> {
    let server = config.server(name)?;
    let session = Session::open(name, server).await;

    let result = async {
        let client = session.breaker.call(|| session.pool.acquire(None)).await?;
        let tools = session.breaker.call(|| client.list_tools()).await;
        session.pool.release(client).await;
        anyhow::Ok(tools?)
    }
    .await;
    session.pool.close().await;

    let tools = result.with_context(|| format!("Failed to list tools of '{}'", name))?;
    info!("Found {} tools on {}", tools.len(), name);
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}

async fn call_tool(
    config: &Config,
    name: &str,
    tool: &str,
    raw_args: &str,
    timeout: Option<f64>,
) -> Result<()> {
    let arguments: Value = serde_json::from_str(raw_args).context("--args must be valid JSON")?;
    if !arguments.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    let timeout = timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--timeout must be a non-negative number of seconds")?;

    let server = config.server(name)?;
    let session = Session::open(name, server).await;

    let result = async {
        let client = session.breaker.call(|| session.pool.acquire(None)).await?;
        let output = session
            .breaker
            .call(|| client.call_tool(tool, arguments, timeout))
            .await;
        session.pool.release(client).await;
        anyhow::Ok(output?)
    }
    .await;
    session.pool.close().await;

    let output = result.with_context(|| format!("Tool '{}' on '{}' failed", tool, name))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn status(config: &Config, name: &str) -> Result<()> {
    let server = config.server(name)?;
    let session = Session::open(name, server).await;

    let (healthy, server_info, error) = match session.breaker.call(|| session.pool.acquire(None)).await {
        Ok(client) => {
            let healthy = client.is_healthy().await;
            let server_info = client.server_info();
            session.pool.release(client).await;
            (healthy, server_info, None)
        }
        Err(e) => (false, None, Some(e.to_json())),
    };

    let report = json!({
        "server": name,
        "healthy": healthy,
        "server_info": server_info,
        "error": error,
        "pool": session.pool.metrics().to_json(),
        "circuit_breaker": session.breaker.metrics().to_json(),
    });
    session.pool.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
