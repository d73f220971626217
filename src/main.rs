use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use esclusa::config::{Config, ConfigError};
use esclusa::{Esclusa, ProxyConfig};
use log::info;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "esclusa")]
#[command(about = "A connection-pooling proxy for MongoDB replica sets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_proxy(config),
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn run_proxy(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config)?;

    info!("Starting esclusa v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.server.listen_addr);
    info!("Replica set members: {:?}", config.topology.members);

    let proxy_config = proxy_config_from(&config);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.server.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let runtime = builder.build().context("building runtime")?;

    runtime.block_on(async move {
        let mut proxy = Esclusa::new(proxy_config);
        proxy
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start proxy: {}", e))?;

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("Shutdown signal received");
        proxy.shutdown().await;
        Ok(())
    })
}

fn proxy_config_from(config: &Config) -> ProxyConfig {
    ProxyConfig {
        listen_addr: config.server.listen_addr.clone(),
        seed_members: config.topology.members.clone(),
        max_connections: config.server.max_connections,
        pool_per_member: config.pool.per_member,
        acquire_timeout: Duration::from_millis(config.pool.acquire_timeout_ms),
        connect_timeout: Duration::from_millis(config.pool.connect_timeout_ms),
        idle_timeout: Duration::from_secs(config.session.idle_timeout_sec),
        max_message_size: config.session.max_message_size,
        probe_interval: Duration::from_secs(config.topology.probe_interval_sec),
        probe_timeout: Duration::from_secs(config.topology.probe_timeout_sec),
        removal_grace_cycles: config.topology.removal_grace_cycles,
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| anyhow::anyhow!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  esclusa run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Max backend connections: {}", config.server.max_connections);
            println!(
                "  Replica set members: {} configured",
                config.topology.members.len()
            );
            for (i, member) in config.topology.members.iter().enumerate() {
                println!("    {}: {}", i + 1, member);
            }
            println!(
                "  Pool: {} per member, acquire timeout {}ms",
                config.pool.per_member, config.pool.acquire_timeout_ms
            );
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("esclusa v{}", env!("CARGO_PKG_VERSION"));
    println!("A connection-pooling proxy for MongoDB replica sets");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Bounded backend connection pooling per replica set member");
    println!("  • Automatic primary/secondary discovery and failover tracking");
    println!("  • Session pinning for read-your-writes and cursor continuity");
    println!("  • Idle and chatty client eviction");
}

fn init_logging(config: &Config) -> Result<()> {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    // tracing events from the core modules; the log bridge is already
    // claimed by env_logger, which try_init tolerates
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .try_init();

    info!("Logging initialized at level: {:?}", log_level);
    Ok(())
}
