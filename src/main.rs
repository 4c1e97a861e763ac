#![forbid(unsafe_code)]

//! `rtm-relay`: Slack RTM bridge binary.
//!
//! Bootstraps configuration and credentials, then runs the RTM stream loop
//! with a dispatcher that gives every direct-message user their own program
//! session.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use rtm_relay::config::GlobalConfig;
use rtm_relay::orchestrator::dispatcher::Dispatcher;
use rtm_relay::orchestrator::registry::SessionRegistry;
use rtm_relay::process::session::SessionConfig;
use rtm_relay::slack::stream::{RtmConnector, StreamClient};
use rtm_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "rtm-relay", about = "Slack RTM to interactive program bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("rtm-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    info!(executable = config.executable, "configuration loaded");

    // ── Build the dispatcher ────────────────────────────
    let registry = Arc::new(SessionRegistry::new());
    let max_sessions = usize::try_from(config.max_sessions).unwrap_or(usize::MAX);
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        SessionConfig::from(&config),
        max_sessions,
    );

    // ── Run the stream loop ─────────────────────────────
    let client = StreamClient::new(
        RtmConnector::new(&config.slack),
        config.keepalive(),
        config.slack.direct_channel_prefix.clone(),
    );

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let outcome = client.run_forever(&dispatcher, ct).await;
    if let Err(ref err) = outcome {
        error!(%err, "stream client stopped");
    }

    // ── Graceful shutdown ───────────────────────────────
    dispatcher.shutdown().await;
    info!("rtm-relay shut down");

    outcome
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
