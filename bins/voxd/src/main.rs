//! voxd CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use voxd_server::Config;

#[derive(Parser)]
#[clap(version, about = "Versioned volumetric data server")]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server from a TOML configuration file.
    Serve {
        /// Path to the configuration file.
        config: PathBuf,
        /// Refuse every request except GET and HEAD.
        #[clap(long)]
        readonly: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, readonly } => {
            let config = match Config::load(&config) {
                Ok(config) => config,
                Err(err) => {
                    tracing::error!(error = %err, "fatal startup failure");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(err) = voxd_server::serve(config, readonly).await {
                tracing::error!(error = %err, "fatal startup failure");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
