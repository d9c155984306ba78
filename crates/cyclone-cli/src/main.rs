//! Cyclone CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::ApiClient;

#[derive(Parser)]
#[command(name = "cyclone")]
#[command(about = "Cyclone worker orchestration CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "CYCLONE_API_URL", default_value = "http://localhost:7099")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "cyclone.kdl")]
        path: String,
    },
    /// Manage registered clouds
    Clouds {
        #[command(subcommand)]
        command: CloudCommands,
    },
    /// Show capacity and usage of every cloud
    Resources,
    /// List workers running on every cloud
    Workers,
    /// Inspect queued events
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },
}

#[derive(Subcommand)]
enum CloudCommands {
    /// List registered clouds
    List,
    /// Check that a cloud is reachable
    Ping {
        /// Cloud name
        name: String,
    },
    /// Unregister a cloud
    Delete {
        /// Cloud name
        name: String,
    },
}

#[derive(Subcommand)]
enum EventCommands {
    /// Show an event
    Get {
        /// Event ID
        id: String,
    },
    /// Delete an event, terminating its worker
    Delete {
        /// Event ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Clouds { command } => {
            let client = ApiClient::new(&cli.api_url)?;
            match command {
                CloudCommands::List => commands::clouds::list(&client).await?,
                CloudCommands::Ping { name } => commands::clouds::ping(&client, &name).await?,
                CloudCommands::Delete { name } => commands::clouds::delete(&client, &name).await?,
            }
        }
        Commands::Resources => {
            commands::fleet::resources(&ApiClient::new(&cli.api_url)?).await?;
        }
        Commands::Workers => {
            commands::fleet::workers(&ApiClient::new(&cli.api_url)?).await?;
        }
        Commands::Events { command } => {
            let client = ApiClient::new(&cli.api_url)?;
            match command {
                EventCommands::Get { id } => commands::events::get(&client, &id).await?,
                EventCommands::Delete { id } => commands::events::delete(&client, &id).await?,
            }
        }
    }

    Ok(())
}
