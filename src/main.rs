use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use shardgate::config::{Config, ConfigError};
use shardgate::ShardGate;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shardgate")]
#[command(about = "A MySQL wire-compatible sharding proxy with master/replica failover")]
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
        #[arg(short, long, default_value = "config/shardgate.toml")]
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_shardgate(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_shardgate(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting shardgate v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.server.listen_addr);

    let gate = ShardGate::new(config).context("Failed to initialize shardgate")?;
    gate.run().await.context("Failed to run shardgate")?;

    info!("shardgate stopped");
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  shardgate run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Max connections: {}", config.server.max_connections);
            println!("  Nodes: {}", config.nodes.len());
            for node in &config.nodes {
                match &node.slave {
                    Some(slave) => println!("    {}: master {}, slave {}", node.name, node.master, slave),
                    None => println!("    {}: master {}", node.name, node.master),
                }
            }
            println!("  Schemas: {}", config.schemas.len());
            for schema in &config.schemas {
                println!(
                    "    {}: {} shard rule(s), default node {}",
                    schema.db,
                    schema.rules.shard.len(),
                    schema.rules.default
                );
            }
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
    println!("shardgate v{}", env!("CARGO_PKG_VERSION"));
    println!("A MySQL wire-compatible sharding proxy with master/replica failover");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Hash and range sharding with fan-out query merging");
    println!("  • Master/replica read split with health-checked failover");
    println!("  • Prepared statements and per-node transactions");
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

    match config.logging.format.as_str() {
        "json" => {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_str()));
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
        _ => {
            env_logger::Builder::new()
                .filter_level(log_level)
                .parse_default_env()
                .try_init()
                .context("Failed to initialize logging")?;
        }
    }

    info!("Logging initialized at level: {:?}", log_level);
    Ok(())
}
