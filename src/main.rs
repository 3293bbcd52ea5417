use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use covagent::config::{AgentConfig, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "covagent",
    about = "In-cluster agent that collects, merges and reports code coverage",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (topology watch + run scheduling)
    Serve {
        /// Config file (defaults to $COVAGENT_CONFIG, then /etc/covagent/covagent.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        /// Config file to load instead of the default locations
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate the effective configuration and exit
    CheckConfig {
        /// Config file to load instead of the default locations
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::load_or_default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging);
            covagent::serve(config).await?;
        }
        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;
            println!("Configuration OK");
        }
    }

    Ok(())
}
