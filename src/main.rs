#![forbid(unsafe_code)]

//! `tensorwatch`: debugger server binary.
//!
//! Bootstraps configuration, accepts training-process connections over TCP,
//! and serves the local API to `tensorwatch-ctl` over IPC.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use tensorwatch::config::GlobalConfig;
use tensorwatch::ipc::server::{spawn_ipc_server, IpcContext};
use tensorwatch::orchestrator::session_manager::SessionManager;
use tensorwatch::{AppError, Result};

/// Environment variable that pins the IPC auth token.
const AUTH_TOKEN_ENV: &str = "TENSORWATCH_IPC_TOKEN";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tensorwatch", about = "Live watchpoint debugger for model training", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the training-process listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("tensorwatch server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
        config.validate()?;
    }
    let config = Arc::new(config);
    info!(
        listen_addr = config.listen_addr.as_str(),
        max_sessions = config.max_sessions,
        "configuration loaded"
    );

    let ct = CancellationToken::new();
    let manager = Arc::new(SessionManager::new(Arc::clone(&config), ct.child_token()));

    // ── Start background services ───────────────────────
    let gc_handle = manager.spawn_gc_task(ct.clone());

    let auth_token = std::env::var(AUTH_TOKEN_ENV)
        .ok()
        .filter(|token| !token.is_empty());
    if auth_token.is_none() {
        warn!("{AUTH_TOKEN_ENV} not set; IPC requests are not authenticated");
    }
    let ipc_handle = spawn_ipc_server(
        IpcContext {
            manager: Arc::clone(&manager),
            auth_token,
        },
        ct.clone(),
    )?;

    // ── Accept training processes ───────────────────────
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|err| AppError::Io(format!("cannot bind {}: {err}", config.listen_addr)))?;
    info!(addr = config.listen_addr.as_str(), "listening for training processes");

    let accept_ct = ct.clone();
    let accept_manager = Arc::clone(&manager);
    let accept_handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = accept_ct.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Err(err) = stream.set_nodelay(true) {
                                warn!(%err, %peer, "failed to set TCP_NODELAY");
                            }
                            let (source, sink) = stream.into_split();
                            match accept_manager.attach(source, sink) {
                                Ok(handle) => info!(session_id = handle.id(), %peer, "training process connected"),
                                Err(err) => warn!(%err, %peer, "connection rejected"),
                            }
                        }
                        Err(err) => error!(%err, "accept failed"),
                    },
                }
            }
        }
        .instrument(info_span!("tcp_accept")),
    );

    info!("tensorwatch ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    manager.shutdown().await;
    let _ = tokio::join!(accept_handle, ipc_handle, gc_handle);
    info!("tensorwatch shut down");

    Ok(())
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
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
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
