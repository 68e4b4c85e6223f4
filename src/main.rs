use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use runweave::config::Settings;
use runweave::service::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "runweave")]
#[command(version, about = "Pattern-learning orchestrator for an external code-generation CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "8787")]
        port: u16,

        /// Path to the embedded database
        #[arg(long)]
        database_path: Option<PathBuf>,

        /// Root directory for per-run workspaces
        #[arg(long)]
        workspace_root: Option<PathBuf>,

        /// Root directory for persisted artifacts
        #[arg(long)]
        artifacts_root: Option<PathBuf>,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            port,
            database_path,
            workspace_root,
            artifacts_root,
            dev,
        } => {
            let mut settings = Settings::from_env();
            if let Some(path) = database_path {
                settings.database_path = path;
            }
            if let Some(path) = workspace_root {
                settings.workspace_root = path;
            }
            if let Some(path) = artifacts_root {
                settings.artifacts_root = path;
            }
            start_server(ServerConfig {
                port,
                settings,
                dev_mode: dev,
            })
            .await
        }
    }
}
