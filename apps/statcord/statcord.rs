//! # statcord
//!
//! Command line front end for the cluster statcord agent. Runs the posting
//! loop against a fixed host description taken from the `[standalone]`
//! section of the configuration, and offers config tooling.

// ============================================================================
// SECTION 1: IMPORTS
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cluster_statcord::{
    init_logging, AgentConfig, ConfigError, StaticHost, StatcordClient, StatcordResult,
    AGENT_FULL_NAME, AGENT_VERSION,
};

// ============================================================================
// SECTION 2: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 2.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Cluster Statcord CLI
#[derive(Parser, Debug)]
#[command(
    name = "statcord",
    version,
    about = "Posts per-cluster bot usage metrics to Statcord",
    long_about = "Aggregates active users, command usage, memory, CPU and bandwidth \
                  for one cluster of a sharded bot and posts a snapshot to the \
                  Statcord cluster endpoint on a fixed interval."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "statcord.toml", env = "STATCORD_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "STATCORD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log payloads and responses
    #[arg(short, long)]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the posting loop
    Run,

    /// Build one snapshot and print it without posting
    Probe,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 2.2 Command Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> StatcordResult<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::load(config_path)?;

    println!("✓ Configuration is valid");
    println!("  • Endpoint: {}", config.endpoint()?);
    println!("  • Cluster: {}", config.cluster_id);
    println!("  • Interval: {}s", config.post_interval.as_secs());
    println!(
        "  • Tracking: memory={} cpu={} bandwidth={}",
        config.track_memory, config.track_cpu, config.track_bandwidth
    );
    if config.standalone.is_none() {
        println!("  • No [standalone] section, `run` and `probe` are unavailable");
    }

    if verbose {
        let mut shown = config.clone();
        shown.api_key = "<redacted>".into();
        println!();
        println!("Full configuration:");
        println!("{:#?}", shown);
    }

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> StatcordResult<()> {
    let config = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            std::fs::write(path, &config)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", config),
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", AGENT_FULL_NAME, AGENT_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
}

fn standalone_host(config: &AgentConfig) -> Result<Arc<StaticHost>, ConfigError> {
    config
        .standalone
        .as_ref()
        .map(|s| Arc::new(StaticHost::from_config(s)))
        .ok_or_else(|| ConfigError::missing_field("standalone"))
}

fn handle_probe(config: AgentConfig) -> AnyhowResult<()> {
    let host = standalone_host(&config)?;
    let client = StatcordClient::new(config, host)?;

    let snapshot = client
        .build_snapshot()
        .context("Failed to build snapshot")?;
    println!("{}", serde_json::to_string_pretty(&snapshot.redacted_json())?);

    Ok(())
}

async fn handle_run(config: AgentConfig) -> AnyhowResult<()> {
    let host = standalone_host(&config)?;
    let client = Arc::new(StatcordClient::new(config, host.clone())?);

    let handle = client.start_loop();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(target: "statcord::cli", "Interrupt received"),
        Err(e) => warn!(target: "statcord::cli", error = %e, "Failed to listen for ctrl-c"),
    }

    host.close();
    client.shutdown();
    handle.await.context("Posting loop task failed")?;

    let stats = client.stats();
    info!(
        target: "statcord::cli",
        ticks = stats.ticks,
        posted = stats.posts_succeeded,
        failures = stats.failures,
        rate_limited = stats.rate_limited,
        "Agent stopped"
    );

    Ok(())
}

// ============================================================================
// SECTION 3: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need a loaded configuration
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = AgentConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        config.debug = true;
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;

    info!("{} v{}", AGENT_FULL_NAME, AGENT_VERSION);

    match cli.command {
        Some(Commands::Probe) => handle_probe(config)?,
        Some(Commands::Run) | None => handle_run(config).await?,
        Some(Commands::Version)
        | Some(Commands::GenerateConfig { .. })
        | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}
