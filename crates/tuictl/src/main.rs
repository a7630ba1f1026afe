//! tuictl - command-line hub client
//!
//! Subcommands:
//! - `tuictl monitor` - Connect and print every reply until Ctrl-C
//! - `tuictl send <actor> <cmd...>` - Send one command and wait for it
//! - `tuictl replay <file>` - Feed recorded replies through the actor models
//! - `tuictl config` - Show the merged configuration

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubconf::HubConfig;
use tokio::task::LocalSet;

mod commands;
mod replay;
mod telemetry;

#[derive(Parser)]
#[command(name = "tuictl")]
#[command(about = "Command-line client for the telescope hub")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./tui.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Hub host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Hub port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every reply from the hub until interrupted
    Monitor {
        /// Only show replies from this actor
        #[arg(short, long)]
        actor: Option<String>,

        /// One JSON object per reply
        #[arg(long)]
        json: bool,
    },

    /// Send a command and print its replies
    Send {
        /// Actor to command (e.g. tcc, gifs)
        actor: String,

        /// Command verb and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,

        /// Time limit in seconds
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// Replay a file of reply lines through the actor models
    Replay {
        /// File of full reply lines or `<actor> <keywords>` shorthand
        file: PathBuf,

        /// Pause between lines in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },

    /// Show the merged configuration and its sources
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (mut config, sources) = HubConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.hub.host = host;
    }
    if let Some(port) = cli.port {
        config.hub.port = port;
    }

    telemetry::init(&config.telemetry)?;

    LocalSet::new()
        .run_until(async move {
            match cli.command {
                Commands::Monitor { actor, json } => {
                    commands::monitor(config, actor, json).await?;
                }
                Commands::Send {
                    actor,
                    cmd,
                    timeout,
                } => {
                    return commands::send(config, &actor, &cmd, timeout).await;
                }
                Commands::Replay { file, delay_ms } => {
                    replay::run(&file, delay_ms).await?;
                }
                Commands::Config => {
                    commands::show_config(&config, &sources);
                }
            }
            Ok(ExitCode::SUCCESS)
        })
        .await
}
