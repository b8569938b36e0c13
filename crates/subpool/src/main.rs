//! Subpool daemon - serves aggregated proxy subscriptions over HTTP

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use subpool::SubpoolError;
use subpool::config::Config;
use subpool::error::Result;
use subpool::server::SubpoolServer;
use subpool::token::fake_token;

/// Subpool - aggregate proxy subscriptions per tenant group
#[derive(Parser)]
#[command(name = "subpool")]
#[command(about = "A multi-tenant proxy subscription aggregator")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the subscription server (default command)
    #[command(name = "serve")]
    Serve,

    /// Print today's callback token for a group
    #[command(name = "fake-token")]
    FakeToken {
        /// Group id
        #[arg(long)]
        group: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
        Some(Command::FakeToken { group }) => print_fake_token(cli.config, &group),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,subpool=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve the stored config, overlay the environment and validate
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            Config::from_file(&path)?
        }
        None => {
            let default_paths = [
                dirs::home_dir().map(|h| h.join(".subpool").join("config.toml")),
                dirs::config_dir().map(|c| c.join("subpool").join("config.toml")),
                Some(PathBuf::from("config.toml")),
            ];

            match default_paths.iter().flatten().find(|p| p.exists()) {
                Some(path) => {
                    tracing::info!("Loading config from: {}", path.display());
                    Config::from_file(path)?
                }
                None => {
                    tracing::info!("No config file found, using defaults");
                    Config::default()
                }
            }
        }
    };

    config.apply_env();
    config.validate()?;
    Ok(config)
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Subpool daemon");

    let config = load_config(config_path)?;
    tracing::debug!(
        groups = config.groups.len(),
        extra_sources = config.fetch.extra_sources.len(),
        "Config loaded"
    );

    SubpoolServer::new(config).serve().await?;

    tracing::info!("Subpool daemon stopped");
    Ok(())
}

fn print_fake_token(config_path: Option<PathBuf>, group_id: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let group = config
        .groups
        .iter()
        .find(|g| g.id == group_id)
        .ok_or_else(|| SubpoolError::Group(format!("Unknown group '{group_id}'")))?;

    println!("{}", fake_token(&group.token, Utc::now()));
    Ok(())
}
