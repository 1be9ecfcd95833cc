//! navarchd — Navarch control plane daemon.
//!
//! Loads a `NavarchConfig`, wires up the registry, heartbeat monitor, and
//! pool manager, and runs until interrupted. The RPC transport that
//! exposes `NodeRegistry`'s methods to nodes is not part of this binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use navarch_config::NavarchConfig;
use navarchd::ControlPlane;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "navarchd")]
#[command(about = "Navarch GPU fleet control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (registry, heartbeat monitor, pool manager).
    Run {
        /// Path to config file.
        #[arg(short, long, default_value = "/etc/navarchd/config.json")]
        config: PathBuf,
    },

    /// Write a default config file.
    InitConfig {
        /// Path to write config.
        #[arg(short, long, default_value = "/etc/navarchd/config.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("navarchd=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::InitConfig { output } => init_config(output),
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting navarchd");
    let config = NavarchConfig::load(&config_path)?;

    let plane = ControlPlane::new(&config);
    plane.start().await;
    info!("control plane started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    plane.stop().await;

    Ok(())
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = NavarchConfig::default();
    config.save(&output)?;
    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to taste, then run:");
    println!("  navarchd run --config {}", output.display());
    Ok(())
}
