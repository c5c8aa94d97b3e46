//! tshd: device-side remote shell daemon.
//!
//! Holds one WebSocket connection to the management server and multiplexes
//! PTY-backed shell sessions over it.

mod auth;
mod config;
mod connection;
mod daemon;
mod router;
mod session;
mod sweeper;

use auth::ConfiguredTokenProvider;
use clap::Parser;
use config::{ConfigOverrides, DaemonConfig};
use connection::WebSocketDialer;
use daemon::Daemon;
use session::PtySpawner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// tshd: remote shell daemon
#[derive(Parser, Debug)]
#[command(name = "tshd", version, about = "Remote shell daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.tsh/config.toml")]
    config: String,

    /// Management server URL (ws:// or wss://)
    #[arg(long)]
    server_url: Option<String>,

    /// Bearer token for the server
    #[arg(long)]
    token: Option<String>,

    /// File holding the bearer token, re-read on every (re)connect
    #[arg(long)]
    token_file: Option<String>,

    /// Shell command to run for each session
    #[arg(long)]
    shell: Option<String>,

    /// Run shells as this user
    #[arg(long)]
    user: Option<String>,

    /// Terminal width in columns
    #[arg(long)]
    width: Option<u16>,

    /// Terminal height in rows
    #[arg(long)]
    height: Option<u16>,

    /// Maximum concurrent sessions per user
    #[arg(long)]
    max_user_sessions: Option<usize>,

    /// Maximum concurrent sessions overall
    #[arg(long)]
    max_shells: Option<usize>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Close sessions older than this many seconds (0 = never)
    #[arg(long)]
    expire_after: Option<u64>,

    /// Close sessions idle for this many seconds (0 = never)
    #[arg(long)]
    expire_after_idle: Option<u64>,

    /// Log a status report on every sweep
    #[arg(long)]
    print_status: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server_url: self.server_url.clone(),
            token: self.token.clone(),
            token_file: self.token_file.clone(),
            shell_command: self.shell.clone(),
            user: self.user.clone(),
            terminal_width: self.width,
            terminal_height: self.height,
            max_user_sessions: self.max_user_sessions,
            max_shells_spawned: self.max_shells,
            max_reconnect_attempts: self.max_reconnect_attempts,
            expire_after: self.expire_after,
            expire_after_idle: self.expire_after_idle,
            print_status: self.print_status,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tshd");

    let config_path = PathBuf::from(&cli.config);
    let config = match DaemonConfig::load(Some(&config_path), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let Some(token_source) = config.token_source.clone() else {
        error!("no token source configured");
        std::process::exit(1);
    };
    let tokens = ConfiguredTokenProvider::from(token_source);

    info!(
        url = %config.server_url,
        shell = %config.shell_command,
        max_user_sessions = config.max_user_sessions,
        max_shells = config.max_shells_spawned,
        "configuration loaded"
    );

    let daemon = Daemon::new(config, WebSocketDialer, tokens, Arc::new(PtySpawner));

    // Run until shutdown signal, then let the daemon tear down its sessions.
    let run = daemon.run();
    tokio::pin!(run);
    let result = tokio::select! {
        res = &mut run => res,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            daemon.stop();
            run.await
        }
    };

    daemon.print_status().await;
    if let Err(e) = result {
        error!(error = %e, "daemon error");
        std::process::exit(1);
    }
    info!("tshd stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, only Ctrl+C stops the daemon");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
