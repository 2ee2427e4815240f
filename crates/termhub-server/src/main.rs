//! termhub-server: shell multiplexer over WebSocket.
//!
//! Spawns shells on pseudo-terminals (or pipes), shares each one with any
//! number of authenticated WebSocket observers, and streams lifecycle events
//! to management clients.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use termhub_server::config::{self, Overrides, ServerConfig};
use termhub_server::transport::tls;
use termhub_server::TermhubServer;
use tracing::{error, info};

/// termhub-server: share live shell sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "termhub-server", version, about = "Share live shell sessions over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termhub/config.toml")]
    config: String,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Maximum concurrent live sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Shell to launch for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termhub-server");

    let mut overrides = Overrides {
        port: cli.port,
        bind: cli.bind.clone(),
        cert: cli.cert.clone(),
        key: cli.key.clone(),
        max_sessions: cli.max_sessions,
        shell: cli.shell.clone(),
    };

    if cli.generate_cert {
        match tls::generate_self_signed_cert(&config::termhub_dir()) {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                overrides.cert = Some(c.display().to_string());
                overrides.key = Some(k.display().to_string());
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    }

    // Load server config (file + CLI overrides)
    let server_config = match ServerConfig::load(&PathBuf::from(&cli.config), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Channel reads park a blocking thread each; config validation keeps
    // the pool larger than the session limit.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(server_config.worker_threads_max)
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(server_config)) {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("termhub-server stopped");
}

async fn serve(config: ServerConfig) -> termhub_core::TermhubResult<()> {
    let server = Arc::new(TermhubServer::new(config)?);
    let listener = server.bind().await?;

    tokio::select! {
        result = server.clone().run(listener) => result?,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    Ok(())
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
                error!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
