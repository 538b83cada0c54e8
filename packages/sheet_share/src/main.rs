use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use sheet_share::config::{
    ClientConfig, FileConfig, Profile, ServerConfig, SheetShareConfig, load_config,
};

#[derive(Parser)]
#[command(name = "sheet-share")]
#[command(about = "Presence and character-sharing relay for character sheets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.sheet-share)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration preset (overrides `profile` in config.toml)
    #[arg(long, global = true, value_enum)]
    profile: Option<Profile>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Server(ServerArgs),

    /// Connect interactively as a named user
    Connect(ConnectArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ConnectArgs {
    /// Display name to register under
    #[arg(short, long)]
    username: String,

    /// Share socket URL (defaults to `[client] url` from config)
    #[arg(long)]
    url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = SheetShareConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&dirs.data_dir, cli.profile.as_ref())
        .extract()
        .with_context(|| {
            format!(
                "Invalid configuration (check {} and SHEET_* variables)",
                dirs.config_toml_path().display()
            )
        })?;

    match cli.command {
        Commands::Server(args) => run_server(args, &file_config).await,
        Commands::Connect(args) => run_connect(args, &file_config).await,
    }
}

async fn run_server(args: ServerArgs, file_config: &FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "sheet_share=debug,tower_http=debug,info"
    } else {
        "sheet_share=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting character share relay");

    let server_config =
        ServerConfig::from_file(&file_config.server).with_overrides(args.host, args.port);
    let addr = server_config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    sheet_share::serve(listener, server_config, shutdown_signal).await
}

async fn run_connect(args: ConnectArgs, file_config: &FileConfig) -> Result<()> {
    // Logs go to stderr so they don't interleave with the chat output
    let default_directive = if args.debug {
        "sheet_share=debug,warn"
    } else {
        "sheet_share=warn,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut client_config = ClientConfig::from_file(&file_config.client);
    if let Some(url) = args.url {
        client_config.url = url;
    }

    let username = args.username.trim().to_string();
    anyhow::ensure!(!username.is_empty(), "Username must not be empty");

    sheet_share::cli::connect_command(client_config, username).await
}
