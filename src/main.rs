//! cti-bar - softphone call bar and outbound auto-dialer
//!
//! Inspect configuration and dry-run dial lists from the terminal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cti_bar::signaling::loopback::{LoopbackClient, LoopbackScript};
use cti_bar::task::PauseSource;
use cti_bar::{CallTarget, Command, Config, CtiBar, CtiEvent, Notification, TaskEvent};

#[derive(Parser)]
#[command(name = "cti-bar")]
#[command(about = "Softphone call bar and outbound auto-dialer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the per-user default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved connection settings
    Config,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a dial list against a scripted in-process user agent
    Simulate {
        /// TOML file with [[target]] entries (id, phone)
        #[arg(short, long)]
        targets: PathBuf,

        /// Numbers that never answer
        #[arg(long = "no-answer")]
        no_answer: Vec<String>,

        /// Ring time before answer, milliseconds
        #[arg(long, default_value = "2000")]
        ring_ms: u64,

        /// Talk time before the far end hangs up, milliseconds
        #[arg(long, default_value = "5000")]
        talk_ms: u64,

        /// Hold the task after each answered call, resuming after the talk time
        #[arg(long)]
        after_call_work: bool,
    },
}

#[derive(Debug, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    target: Vec<CallTarget>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let config = Config::load_from(&config_path)?;

    // Initialize logging; stdout is reserved for event output
    let filter = if cli.verbose || config.sip.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Config => show_config(&config_path, &config)?,
        Commands::Init { force } => init_config(&config_path, force)?,
        Commands::Simulate {
            targets,
            no_answer,
            ring_ms,
            talk_ms,
            after_call_work,
        } => {
            let script = LoopbackScript {
                ring: Duration::from_millis(ring_ms),
                talk: Duration::from_millis(talk_ms),
                no_answer: no_answer.into_iter().collect::<HashSet<_>>(),
            };
            simulate(config, &targets, script, after_call_work).await?;
        }
    }

    Ok(())
}

fn show_config(path: &Path, config: &Config) -> Result<()> {
    println!("Config file:   {}", path.display());
    println!("WebSocket URL: {}", config.sip.websocket_url());
    println!("SIP URI:       {}", config.sip.sip_uri());
    println!("Auto register: {}", config.sip.auto_register);
    println!(
        "After-call work: {}",
        if config.task.auto_after_call_work {
            "on"
        } else {
            "off"
        }
    );
    println!("ICE servers:");
    for server in config.sip.ice_servers() {
        println!("  {}", serde_json::to_string(&server)?);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save_to(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn simulate(
    mut config: Config,
    targets_path: &Path,
    script: LoopbackScript,
    after_call_work: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(targets_path)
        .with_context(|| format!("Failed to read {}", targets_path.display()))?;
    let file: TargetsFile = toml::from_str(&text).context("Failed to parse targets file")?;
    anyhow::ensure!(
        !file.target.is_empty(),
        "No [[target]] entries in {}",
        targets_path.display()
    );
    tracing::info!("Loaded {} target(s)", file.target.len());

    config.task.auto_after_call_work = after_call_work;
    let wrap_up = script.talk;

    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let client = LoopbackClient::new(config.sip.ext_no.clone(), script, raw_tx);
    let (bar, handle) = CtiBar::new(client, &config, raw_rx, notify_tx);
    let event_loop = tokio::spawn(bar.run());

    handle.send(Command::AddTasks(file.target))?;

    let mut started = false;
    loop {
        tokio::select! {
            notification = notify_rx.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                println!("{}", serde_json::to_string(&notification)?);

                match notification {
                    Notification::Phone(CtiEvent::Registered { .. }) if !started => {
                        started = true;
                        handle.send(Command::StartTask)?;
                    }
                    Notification::Task(TaskEvent::CallEnd(_)) if after_call_work => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(wrap_up).await;
                            let _ = handle.send(Command::NextTask);
                        });
                    }
                    Notification::Task(TaskEvent::TaskPause(info))
                        if info.source == PauseSource::System =>
                    {
                        tracing::warn!("Task paused by the system ({}), giving up", info.reason);
                        break;
                    }
                    Notification::Task(TaskEvent::TaskEnd(_)) => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown()?;
    event_loop.await??;
    Ok(())
}
