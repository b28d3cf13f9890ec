//! langbridge - Entry Point
//!
//! Starts a language server, initializes it, opens the requested files and
//! prints the server's capabilities. `langbridge init` writes a default
//! configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use langbridge::client::{LanguageClient, TransportKind};
use langbridge::config::{self, BridgeConfig};
use langbridge::rpc::{Trace, TraceFormat};

/// Drive a language server over JSON-RPC.
#[derive(Parser, Debug)]
#[command(name = "langbridge")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server, print its capabilities and shut it down (default).
    Run(RunArgs),
    /// Write a default .langbridge.json into the workspace.
    Init {
        /// Directory to write the configuration into.
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Configuration file (default: <workspace>/.langbridge.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace root directory.
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Language server command to use.
    #[arg(short, long)]
    language_server: Option<String>,

    /// Arguments to pass to the language server.
    #[arg(long, allow_hyphen_values = true)]
    language_server_args: Vec<String>,

    /// Transport: stdio, pipe or socket.
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Port for the socket transport.
    #[arg(long)]
    port: Option<u16>,

    /// Message trace level: off, messages or verbose.
    #[arg(long)]
    trace: Option<Trace>,

    /// Message trace format: text or json.
    #[arg(long)]
    trace_format: Option<TraceFormat>,

    /// Files to open after initialization.
    #[arg(long)]
    open: Vec<PathBuf>,
}

impl RunArgs {
    /// Command-line flags take precedence over the file and environment.
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(server) = &self.language_server {
            config.server_command.clone_from(server);
            config.server_args.clone_from(&self.language_server_args);
        } else if !self.language_server_args.is_empty() {
            config.server_args.clone_from(&self.language_server_args);
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(trace) = self.trace {
            config.trace = trace;
        }
        if let Some(format) = self.trace_format {
            config.trace_format = format;
        }
    }
}

/// Parses the log level string into a tracing Level.
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("invalid log level: {}", other),
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level, json: bool) -> Result<()> {
    // Create an env filter that respects RUST_LOG but has a default level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("langbridge={level}")));

    // Logs go to stderr; stdout carries the capabilities report
    let text = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
    });
    let json = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_current_span(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    // Canonicalize the workspace path
    let workspace = args.workspace.canonicalize().context(format!(
        "failed to canonicalize workspace path: {}",
        args.workspace.display()
    ))?;

    let mut bridge_config = BridgeConfig::load(args.config.as_deref(), &workspace)?;
    args.apply(&mut bridge_config);

    info!(
        workspace = %workspace.display(),
        language_server = %bridge_config.server_command,
        transport = %bridge_config.transport,
        "starting language server"
    );

    let client = LanguageClient::builder()
        .config(bridge_config.to_client_config(&workspace))
        .build()
        .await
        .context("failed to start language client")?;

    info!("language client initialized successfully");

    let report = report_capabilities(&client, &workspace, &args.open).await;
    let shutdown = client
        .shutdown()
        .await
        .context("failed to shut down language server");

    println!("{}", report?);
    shutdown?;

    info!("language server shut down gracefully");
    Ok(())
}

async fn report_capabilities(
    client: &LanguageClient,
    workspace: &Path,
    open: &[PathBuf],
) -> Result<String> {
    for path in open {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            workspace.join(path)
        };
        client
            .did_open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
    }
    serde_json::to_string_pretty(client.server_capabilities())
        .context("failed to serialize server capabilities")
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = parse_log_level(&cli.log_level)?;
    init_tracing(log_level, cli.log_json)?;

    match cli.command {
        Some(Command::Init { workspace }) => {
            let path = config::write_default(&workspace)?;
            println!("Created {}", path.display());
            Ok(())
        }
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}
