//! Loremaster - a tabletop game-master agent framework

use clap::{Parser, Subcommand};
use tracing::error;

mod commands;

use commands::{ask_command, init_command, roll_command, status_command};

/// Loremaster - agents for your game table
#[derive(Parser)]
#[command(name = "lore")]
#[command(about = "◆ A tabletop game-master agent framework")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the vault and default config
    Init,
    /// Dispatch one request to an agent
    Ask {
        /// Agent to address
        agent: String,
        /// Action to request
        action: String,
        /// Payload entries as key=value; values parse as JSON first
        #[arg(short, long)]
        data: Vec<String>,
        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Roll dice in XdY+Z notation
    Roll {
        /// Dice expression, e.g. 2d6+3
        #[arg(default_value = "1d20")]
        expr: String,
    },
    /// Show the table's roster and health
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt::init();
    }

    match cli.command {
        Commands::Init => {
            if let Err(e) = init_command().await {
                error!("Init failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Ask {
            agent,
            action,
            data,
            timeout,
        } => {
            if let Err(e) = ask_command(agent, action, data, timeout).await {
                error!("Ask failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Roll { expr } => {
            if let Err(e) = roll_command(expr).await {
                error!("Roll failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Status => {
            if let Err(e) = status_command().await {
                error!("Status failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
