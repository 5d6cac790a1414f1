//! cgi-gateway
//!
//! Serves legacy CGI programs over HTTP. Units run as native processes, in
//! Docker containers or in a wasmtime sandbox, selected with `--runner`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cgi_gateway::backend::BackendRegistry;
use cgi_gateway::config::{GatewayConfig, Protocol};
use cgi_gateway::gateway::{GatewayEngine, SERVER_SOFTWARE};
use cgi_gateway::server;

#[derive(Parser, Debug)]
#[command(name = "cgi-gateway", version)]
#[command(about = "Serve CGI programs through pluggable execution backends")]
struct Args {
    /// Listen address (host:port, or a socket path with --protocol unix)
    #[arg(short, long, default_value = "localhost:8080")]
    listen: String,

    /// Listener kind
    #[arg(long, value_enum, default_value = "tcp")]
    protocol: Protocol,

    /// URL prefix routed to units
    #[arg(short, long, default_value = "/")]
    prefix: String,

    /// Directory holding units (image name prefix for the docker runner)
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// Required unit suffix, e.g. `.cgi`
    #[arg(short, long, default_value = "")]
    suffix: String,

    /// Execution backend
    #[arg(long, default_value = "os")]
    runner: String,

    /// Execution timeout, e.g. `5s` or `1m30s`
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Container mount `source:target[,ro|rw|volume|tmpfs|npipe|cluster]`
    #[arg(long = "docker-volume")]
    docker_volumes: Vec<String>,

    /// Working directory inside the container
    #[arg(long)]
    docker_workdir: Option<String>,

    /// Forward W3C trace context headers to units
    #[arg(long)]
    propagate_trace: bool,

    /// Read the whole configuration as JSON from CGI_GATEWAY_CONFIG
    #[arg(long)]
    from_env: bool,

    /// Print the available runners and exit
    #[arg(long)]
    list_runners: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shortcut for --log-level debug
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Shortcut for --log-level warn
    #[arg(short, long)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_log: bool,
}

impl Args {
    fn level(&self) -> &str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            &self.log_level
        }
    }

    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            listen: self.listen,
            protocol: self.protocol,
            prefix: self.prefix,
            base_dir: self.base_dir,
            suffix: self.suffix,
            runner: self.runner,
            timeout: self.timeout.filter(|d| !d.is_zero()),
            docker_mounts: self.docker_volumes,
            docker_workdir: self.docker_workdir,
            propagate_trace: self.propagate_trace,
            ..GatewayConfig::default()
        }
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.level()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.json_log {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let registry = BackendRegistry::builtin();
    if args.list_runners {
        println!("{SERVER_SOFTWARE}");
        println!("runners: {}", registry.names().join(", "));
        return Ok(());
    }

    let mut config = if args.from_env {
        GatewayConfig::from_env().context("Failed to load configuration")?
    } else {
        args.into_config()
    };
    config.absolutize_base_dir()?;
    let config = Arc::new(config);

    let backend = registry
        .create(&config.runner, Arc::clone(&config))
        .with_context(|| format!("Failed to initialise runner {:?}", config.runner))?;
    info!(
        runner = backend.name(),
        base_dir = %config.base_dir.display(),
        prefix = %config.prefix,
        timeout = ?config.timeout,
        "Loaded configuration"
    );

    let engine = Arc::new(GatewayEngine::new(config, backend));
    server::serve(engine, shutdown_signal()).await
}
