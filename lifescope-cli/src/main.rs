//! # lifescope CLI
//!
//! Command-line interface for inspecting configuration and exercising the
//! lifescope runtime under load.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lifescope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(long, env = "LIFESCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective runtime configuration as YAML
    Config,

    /// Drive concurrent requests through a runtime and report its metrics
    Simulate {
        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Requests per worker thread
        #[arg(long, default_value_t = 100)]
        requests: usize,

        /// Sessions per worker thread
        #[arg(long, default_value_t = 4)]
        sessions: usize,

        /// Distinct application ids
        #[arg(long, default_value_t = 2)]
        applications: usize,

        /// Renew the request's session every N requests
        #[arg(long)]
        renew_every: Option<usize>,

        /// Return JSON for machine consumption
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            commands::show_config(&config)?;
        }
        Commands::Simulate {
            threads,
            requests,
            sessions,
            applications,
            renew_every,
            json,
        } => {
            let options = commands::SimulateOptions {
                threads,
                requests,
                sessions,
                applications,
                renew_every,
            };
            commands::simulate(config, &options, json)?;
        }
    }

    Ok(())
}
