//! MCP Bridge Server - Binary Entry Point
//!
//! Runs the bridge standalone with the built-in diagnostic tools. The main
//! thread plays the role of an editor's main loop and ticks the executor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_bridge::tools::{register_builtin_tools, StaticToolRegistry};
use mcp_bridge::{BridgeResult, McpHttpServer, ServerConfig, ServerInfo};

/// Interval between executor ticks, roughly one 60 Hz frame
const TICK_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; missing file means defaults
    #[arg(short, long, env = "MCP_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<std::net::IpAddr>,

    /// Endpoint path
    #[arg(long)]
    path: Option<String>,

    /// Require this API key from clients
    #[arg(long)]
    api_key: Option<String>,

    /// Allowed Origin values (repeatable)
    #[arg(long = "allow-origin")]
    allowed_origins: Vec<String>,
}

impl Args {
    fn into_config(self) -> BridgeResult<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env()?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(path) = self.path {
            config.path = path;
        }
        if self.api_key.is_some() {
            config.api_key = self.api_key;
        }
        if !self.allowed_origins.is_empty() {
            config.allowed_origins = self.allowed_origins;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_bridge=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run(Args::parse()) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> BridgeResult<()> {
    let config = args.into_config()?;

    let mut registry = StaticToolRegistry::new();
    register_builtin_tools(&mut registry);
    info!(tools = registry.tool_count(), "registered built-in tools");

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        error!(error = %e, "failed to install Ctrl+C handler");
    }

    let server = McpHttpServer::new(config, ServerInfo::default());
    let mut executor = server.executor(registry)?;
    server.start()?;

    if !server.is_running() {
        return Ok(());
    }

    while running.load(Ordering::SeqCst) {
        executor.tick();
        thread::sleep(TICK_INTERVAL);
    }

    info!("shutting down");
    server.stop();
    Ok(())
}
