//! MeshBase - Peer-to-peer Replication Node
//!
//! Runs one mesh base over TCP and offers a few configuration helpers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshbase::config::MeshBaseConfig;
use meshbase::identifier::IdentifierResolver;
use meshbase::network::{AddressBook, NetworkServer, TcpTransport};
use meshbase::sweeper::Sweeper;
use meshbase::MeshBase;

/// MeshBase - Peer-to-peer Replication Node
#[derive(Parser)]
#[command(name = "meshbase")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "meshbase.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mesh base
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "meshbase.toml")]
        output: PathBuf,

        /// Node identifier
        #[arg(long, default_value = "localhost:7700")]
        identifier: String,

        /// Address to bind for peer communication
        #[arg(long, default_value = "0.0.0.0:7700")]
        bind_address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Resolve identifiers with the configured schemes
    Resolve {
        /// Raw identifiers, resolved as a chain of hops
        #[arg(required = true)]
        hops: Vec<String>,

        /// Entity to append as the access path target
        #[arg(long)]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // the config file may not exist yet for init
    let configured_level = MeshBaseConfig::from_file(&cli.config)
        .map(|c| c.logging.level)
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.log_level.as_deref().unwrap_or(&configured_level));

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init {
            output,
            identifier,
            bind_address,
        } => run_init(output, identifier, bind_address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Resolve { hops, target } => run_resolve(cli.config, hops, target),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<MeshBaseConfig> {
    MeshBaseConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Start the mesh base
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!("Starting mesh base...");
    let config = load_config(&config_path)?;

    let resolver = IdentifierResolver::new(&config.resolver);
    let addresses = AddressBook::from_config(&config, &resolver)?;
    tracing::info!("Address book holds {} peer(s)", addresses.len());

    let (incoming_tx, incoming_rx) = tokio::sync::mpsc::channel(10_000);
    let server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        config.transport.max_frame_bytes,
        incoming_tx,
    ));
    let transport = Arc::new(TcpTransport::new(config.transport.clone(), addresses));

    let mesh = MeshBase::from_config(&config, transport)?;
    tracing::info!("Node identifier: {}", mesh.identifier());
    tracing::info!("Advertising {}", config.advertise_address());

    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Network server failed: {}", e);
            }
        })
    };
    let receive_task = mesh.start(incoming_rx);

    let sweeper_task = if config.sweeper.enabled {
        Some(Sweeper::spawn(mesh.clone(), config.sweeper.interval()))
    } else {
        tracing::info!("Sweeper disabled");
        None
    };

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    mesh.shutdown().await;
    server.stop();
    let _ = server_task.await;
    let _ = receive_task.await;
    if let Some(task) = sweeper_task {
        let _ = task.await;
    }

    tracing::info!("Mesh base stopped");
    Ok(())
}

/// Write a fresh configuration file
fn run_init(output: PathBuf, identifier: String, bind_address: String) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }

    let config = MeshBaseConfig::for_node(identifier, bind_address);
    config.validate()?;
    let content = format!(
        "# MeshBase Configuration\n# Generated configuration file\n\n{}\n\
         # [[peers]]\n# identifier = \"other.example.com\"\n# address = \"10.0.0.2:7700\"\n",
        config.to_toml()?
    );

    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: meshbase start --config {}", output.display());
    Ok(())
}

fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match MeshBaseConfig::from_file(&config_path) {
        Ok(config) => {
            let resolver = IdentifierResolver::new(&config.resolver);
            let identifier = resolver.guess(&config.node.identifier)?;
            AddressBook::from_config(&config, &resolver)?;
            println!("✓ Configuration is valid");
            println!("  Identifier: {}", identifier);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let resolver = IdentifierResolver::new(&config.resolver);

    println!("MeshBase Node Information");
    println!("=========================");
    println!();
    println!("Identifier:       {}", resolver.guess(&config.node.identifier)?);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Resolver:");
    println!("  Schemes:        {}", config.resolver.schemes.join(", "));
    println!("  Default:        {}", config.resolver.default_scheme);
    println!();
    println!("Proxy:");
    println!("  Request:        {} ms", config.proxy.request_timeout_ms);
    println!("  Lock Wait:      {} ms", config.proxy.lock_wait_timeout_ms);
    println!("  Max Timeouts:   {}", config.proxy.max_consecutive_timeouts);
    println!();
    println!("Transport:");
    println!("  Connect:        {} ms", config.transport.connect_timeout_ms);
    println!("  Attempts:       {}", config.transport.max_attempts);
    println!("  Default Port:   {}", config.transport.default_port);
    println!();
    println!("Peers:");
    for peer in &config.peers {
        println!("  {} -> {}", peer.identifier, peer.address);
    }
    println!();
    println!(
        "Sweeper:          {} (every {} ms)",
        if config.sweeper.enabled { "enabled" } else { "disabled" },
        config.sweeper.interval_ms
    );
    Ok(())
}

fn run_resolve(config_path: PathBuf, hops: Vec<String>, target: Option<String>) -> anyhow::Result<()> {
    let config = match MeshBaseConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(_) => MeshBaseConfig::for_node("localhost", "0.0.0.0:7700"),
    };
    let resolver = IdentifierResolver::new(&config.resolver);

    match target {
        Some(target) => {
            let raw: Vec<&str> = hops.iter().map(String::as_str).collect();
            let path = resolver.compose_path(None, &raw, &target, None)?;
            println!("{}", path);
        }
        None => {
            let mut context = None;
            for raw in &hops {
                let identifier = resolver.resolve(context.as_ref(), raw, true)?;
                println!("{} -> {}", raw, identifier);
                context = Some(identifier);
            }
        }
    }
    Ok(())
}
