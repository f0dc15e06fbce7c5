use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use tori::config::format_config;
use tori::context::AppContext;
use tori::daemon::{DaemonServer, ShutdownOutcome};
use tori::engine::RqbitEngine;
use tori::logging::{init_logging, LogConfig};
use tori::process::SystemProcesses;
use tori::registry::ContentId;
use tori::supervisor::{DaemonSupervisor, PlayOutcome, StartOutcome, StopOutcome};

#[derive(Parser)]
#[command(name = "tori")]
#[command(version)]
#[command(about = "Stream magnet links and torrent files into a media player")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Magnet link or .torrent file to add and play
    uri: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the background daemon
    Start,
    /// Stop the background daemon
    Stop {
        /// Start a fresh daemon once this one has stopped
        #[arg(long)]
        restart: bool,
    },
    /// Use a daemon running at another address
    Connect {
        /// Base URL of the daemon, e.g. http://192.168.1.10:8000
        url: String,
    },
    /// Forget the connected daemon
    Disconnect,
    /// Show whether a daemon is reachable
    Status,
    /// List files the daemon is serving
    List,
    /// Play a file the daemon is already serving
    Play {
        /// Content id as printed by `list`
        id: String,
    },
    /// Stop serving a file
    Remove {
        /// Content id as printed by `list`
        id: String,
    },
    /// Download a file completely instead of only what is being watched
    Download {
        /// Content id as printed by `list`
        id: String,
    },
    /// Print the active configuration
    Config,
    /// Run the daemon in the foreground
    #[command(hide = true)]
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = AppContext::load().context("Failed to load configuration")?;

    // The daemon runs detached from any terminal, so it also logs to a file
    let serving = matches!(cli.command, Some(Commands::Serve));
    let _log_guard = init_logging(&if serving {
        LogConfig::daemon(cli.verbose, ctx.paths.log_file.clone())
    } else {
        LogConfig::front_end(cli.verbose)
    });

    let processes = SystemProcesses;
    let supervisor = DaemonSupervisor::new(&ctx, &processes);

    match cli.command {
        None => {
            let Some(uri) = cli.uri else {
                println!("Usage: tori <magnet-link|file.torrent> or tori <COMMAND>; see --help");
                return Ok(());
            };

            match supervisor
                .start_or_play(&uri)
                .await
                .context("Failed to play")?
            {
                PlayOutcome::Playing { pid, urls } => {
                    println!("Started playback of {} file(s) with PID {}", urls.len(), pid);
                }
                PlayOutcome::Printed { urls } => {
                    for url in urls {
                        println!("{}", url);
                    }
                }
                PlayOutcome::Fallback { pid } => {
                    println!("Handed {} to the fallback application (PID {})", uri, pid);
                }
            }
        }
        Some(Commands::Start) => match supervisor.start().await? {
            StartOutcome::AlreadyRunning(handshake) => {
                println!("Server already running at {}", handshake.url);
            }
            StartOutcome::Started { pid } => println!("Started server with PID {}", pid),
        },
        Some(Commands::Stop { restart }) => match supervisor.stop(restart).await? {
            StopOutcome::Stopping(message) => println!("{}", message),
            StopOutcome::NotRunning => println!("Server not running"),
        },
        Some(Commands::Connect { url }) => {
            let handshake = supervisor
                .connect(&url)
                .await
                .with_context(|| format!("Failed to connect to {}", url))?;
            println!("Connected to {} (PID {})", handshake.url, handshake.pid);
        }
        Some(Commands::Disconnect) => {
            supervisor.disconnect()?;
            println!("Disconnected");
        }
        Some(Commands::Status) => match supervisor.status().await {
            Some(handshake) => {
                println!("Server running at {} (PID {})", handshake.url, handshake.pid)
            }
            None => println!("Server not running"),
        },
        Some(Commands::List) => {
            let list = supervisor.list().await?;
            println!("{}", list.message);
            for entry in list.entries {
                println!("{}  {}  {}", entry.id, entry.name, entry.url);
            }
        }
        Some(Commands::Play { id }) => {
            let response = supervisor.play(&ContentId::from_param(&id)).await?;
            println!("{}", response.message);
        }
        Some(Commands::Remove { id }) => {
            let response = supervisor.remove(&ContentId::from_param(&id)).await?;
            println!("{}", response.message);
        }
        Some(Commands::Download { id }) => {
            let response = supervisor.download(&ContentId::from_param(&id)).await?;
            println!("{}", response.message);
        }
        Some(Commands::Config) => {
            println!("{}", format_config(&ctx.config));
            println!();
            println!("  config file: {}", ctx.paths.config_file.display());
        }
        Some(Commands::Serve) => serve(ctx.clone()).await?,
    }

    Ok(())
}

/// Run the daemon until it is stopped
async fn serve(ctx: AppContext) -> Result<()> {
    let engine = Arc::new(
        RqbitEngine::new(&ctx.paths.storage_dir)
            .await
            .context("Failed to start torrent session")?,
    );
    let server = DaemonServer::new(ctx, engine, Arc::new(SystemProcesses));

    match server.run().await.context("Daemon failed")? {
        ShutdownOutcome::Stopped => tracing::info!("Daemon exited"),
        ShutdownOutcome::Restarted => tracing::info!("Daemon exited, replacement started"),
    }
    Ok(())
}
