//! kernel-router CLI entry point.
//!
//! Starts a kernel session and bridges it to stdio: each stdin line is a
//! JSON action (`{"action": ...}`) or command (`{"command": ...}`), and
//! every router event is written to stdout as one JSON line.
//!
//! Besides the toolbar commands, stdin accepts `restart`,
//! `change-kernel` (`kernel_name`), `rename` (`path`) and `send` (`data`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kernel_router::commands::ToolbarCommand;
use kernel_router::config::{config_path, load_config, save_config};
use kernel_router::documents::UntitledNotebooks;
use kernel_router::jupyter::JupyterBackend;
use kernel_router::{Action, DisplaySink, Input, InputSender, Master, RouterEvent};
use log::{info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "kernel-router")]
#[command(about = "Route a Jupyter kernel's side-channel to JSON lines on stdio")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: <config dir>/kernel-router/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a session and route (default if no command specified)
    Run {
        /// Notebook path (default: config `default_path`, else a new untitled notebook)
        #[arg(long)]
        path: Option<String>,

        /// Kernelspec to launch
        #[arg(long)]
        kernel: Option<String>,
    },

    /// Print the effective config
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        init: bool,
    },
}

/// Writes display updates to stdout as `{"type": "display", "data": ...}`.
struct StdoutDisplay;

impl DisplaySink for StdoutDisplay {
    fn set_display(&self, content: &Value) {
        println!("{}", json!({"type": "display", "data": content}));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries events
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let path = cli.config.unwrap_or_else(config_path);

    match cli.command {
        Some(Commands::Config { init }) => {
            let config = load_config(&path)?;
            if init {
                save_config(&path, &config)?;
                info!("Wrote {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Run { path: doc, kernel }) => run(path, doc, kernel).await,
        None => run(path, None, None).await,
    }
}

async fn run(
    config_file: PathBuf,
    document: Option<String>,
    kernel: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_config(&config_file)?;
    if let Some(kernel) = kernel {
        config.kernel_name = kernel;
    }
    info!("kernel-router starting with kernel {}", config.kernel_name);

    let (backend, mut events) = JupyterBackend::new();
    let documents = UntitledNotebooks::new(std::env::current_dir()?);
    let mut master = Master::new(
        config,
        Arc::new(backend),
        Arc::new(documents),
        Arc::new(StdoutDisplay),
    );

    master.subscribe("stdout", |event: &RouterEvent| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
    });

    master.initialize(document).await?;
    info!("{}", master.title());

    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel::<()>();
    let inputs = master.inputs();
    tokio::spawn(async move {
        read_stdin(inputs).await;
        let _ = eof_tx.send(());
    });

    tokio::select! {
        _ = master.run(&mut events) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = eof_rx => info!("stdin closed"),
    }

    // Apply whatever was queued; an unfinished bootstrap is abandoned
    master.drain_inputs().await;
    master.dispose().await;
    Ok(())
}

async fn read_stdin(inputs: InputSender) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_input(line) {
                    Ok(input) => {
                        if !inputs.send(input) {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring input line: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read error: {}", e);
                break;
            }
        }
    }
}

fn parse_input(line: &str) -> anyhow::Result<Input> {
    let value: Value = serde_json::from_str(line)?;
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("missing string field `{}`", name))
    };
    match value.get("command").and_then(Value::as_str) {
        Some("restart") => Ok(Input::Restart),
        Some("change-kernel") => Ok(Input::ChangeKernel {
            kernel_name: field("kernel_name")?,
        }),
        Some("rename") => Ok(Input::Rename {
            path: field("path")?,
        }),
        Some("send") => Ok(Input::Send(value.get("data").cloned().unwrap_or(Value::Null))),
        Some(_) => Ok(Input::Command(serde_json::from_value::<ToolbarCommand>(value)?)),
        None => Ok(Input::Action(Action::from_value(value))),
    }
}
