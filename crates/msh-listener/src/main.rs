//! msh listener daemon
//!
//! Accepts links from remote initiators and runs the requested command for
//! each authorized one, streaming its output back over the link.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msh_core::config::{self, ListenerConfig};
use msh_listener::runtime;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Parser)]
#[command(name = "msh-listener")]
#[command(about = "msh listener daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Identity hash allowed to connect (repeatable)
    #[arg(short = 'a', long = "allowed", value_name = "HASH")]
    allowed: Vec<String>,

    /// Accept any identity
    #[arg(short = 'n', long)]
    no_auth: bool,

    /// Append remote command lines to the default command
    #[arg(short = 'A', long)]
    remote_command_as_args: bool,

    /// Reject remote command lines
    #[arg(short = 'C', long, conflicts_with = "allow_remote_command")]
    no_remote_command: bool,

    /// Accept remote command lines
    #[arg(long)]
    allow_remote_command: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Default command and arguments
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Args {
    fn log_level(&self) -> String {
        let base = if self.foreground {
            "debug"
        } else {
            self.log_level.as_str()
        };
        let Some(index) = LOG_LEVELS.iter().position(|level| level.eq_ignore_ascii_case(base))
        else {
            // Not a plain level; hand it to EnvFilter as a directive
            return base.to_string();
        };

        let index = (index + self.verbose as usize).saturating_sub(self.quiet as usize);
        LOG_LEVELS[index.min(LOG_LEVELS.len() - 1)].to_string()
    }

    fn apply(&self, config: &mut ListenerConfig) {
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        config.allowed_identities.extend(self.allowed.iter().cloned());
        if self.no_auth {
            config.allow_all = true;
        }
        if !self.command.is_empty() {
            config.default_command = self.command.clone();
        }
        if self.remote_command_as_args {
            config.remote_command_as_args = true;
            config.allow_remote_command = true;
        }
        if self.allow_remote_command {
            config.allow_remote_command = true;
        }
        if self.no_remote_command {
            config.allow_remote_command = false;
        }
    }
}

fn load_config(args: &Args) -> Result<ListenerConfig> {
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ListenerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ListenerConfig::default()
        }
    };
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("msh listener starting...");

    let mut config = load_config(&args)?;
    args.apply(&mut config);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    runtime::serve(config, listener, cancel).await?;

    tracing::info!("Listener shutdown complete");
    Ok(())
}
