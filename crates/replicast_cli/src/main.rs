//! Replicast CLI
//!
//! Mirrors pub/sub channels of a connection-management service into memory
//! and logs every change.
//!
//! # Commands
//!
//! - `run` - Log in, subscribe and mirror until interrupted
//! - `token` - Log in and fetch one access token
//! - `version` - Show version information

mod commands;
mod socketcluster;
mod telemetry;

use clap::{Parser, Subcommand};
use commands::run::RunOptions;
use commands::ServiceArgs;
use std::path::PathBuf;
use std::time::Duration;
use telemetry::{TelemetryConfig, DEFAULT_LOG_FILE};

const DEFAULT_BASE_URL: &str = "https://connect.birddog.tv";

/// Replicast channel mirror.
#[derive(Parser)]
#[command(name = "replicast")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Service base URL
    #[arg(global = true, long, env = "REPLICAST_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Websocket URL (derived from the base URL by default)
    #[arg(global = true, long, env = "REPLICAST_SOCKET_URL")]
    socket_url: Option<String>,

    /// Organization id
    #[arg(global = true, short, long, env = "REPLICAST_ORG")]
    org: Option<String>,

    /// Entity type to mirror; repeat for several channels
    #[arg(global = true, short, long = "channel", default_value = "connections")]
    channels: Vec<String>,

    /// Login user name
    #[arg(global = true, short, long, env = "REPLICAST_USER")]
    user: Option<String>,

    /// Login password
    #[arg(global = true, long, env = "REPLICAST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Request timeout in seconds
    #[arg(global = true, long, default_value_t = 30)]
    timeout: u64,

    /// Log file, truncated at start
    #[arg(global = true, long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Log to the console only
    #[arg(global = true, long)]
    no_log_file: bool,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in, subscribe and mirror channels until interrupted
    Run {
        /// Tag connections to or from this endpoint id or claim code
        #[arg(short, long)]
        target: Option<String>,

        /// Tag connections whose source name contains this pattern
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Treat source patterns as regular expressions
        #[arg(long)]
        regex: bool,

        /// Tag connections whose endpoint address equals this value
        #[arg(short, long = "address")]
        addresses: Vec<String>,

        /// Index endpoints by claim code
        #[arg(short, long)]
        index: bool,
    },

    /// Log in and fetch one access token
    Token {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_file = (!cli.no_log_file).then(|| cli.log_file.clone());
    let _telemetry = telemetry::init(TelemetryConfig::new(cli.verbose, log_file));

    let args = ServiceArgs {
        base_url: cli.base_url,
        socket_url: cli.socket_url,
        organization: cli.org,
        channels: cli.channels,
        user: cli.user,
        password: cli.password,
        timeout: Duration::from_secs(cli.timeout),
    };

    match cli.command {
        Commands::Run {
            target,
            sources,
            regex,
            addresses,
            index,
        } => {
            let options = RunOptions {
                target,
                sources,
                regex,
                addresses,
                index,
            };
            commands::run::run(&args, options).await?;
        }
        Commands::Token { format } => {
            commands::token::run(&args, &format).await?;
        }
        Commands::Version => {
            println!("Replicast CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Replicast Engine v{}", replicast_engine::VERSION);
        }
    }

    Ok(())
}
