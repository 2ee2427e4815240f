//! Core server: accepts connections and routes them to the gateway.
//!
//! Owns the session registry and the authenticator, and runs the periodic
//! sweep of closed sessions alongside the accept loop.

use crate::auth::{Authenticator, NoAuthFlag, SessionKeyStore, StaticToken};
use crate::config::ServerConfig;
use crate::gateway;
use crate::session::{PathPolicy, RegistryOptions, RootJail, SessionRegistry, ShellSpawner};
use crate::transport::{self, tls, Listener, WebSocketConnection};
use std::sync::Arc;
use std::time::Duration;
use termhub_core::{TermhubResult, CLOSE_SESSION_NOT_FOUND};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often closed sessions are checked against the retention window.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Where an upgrade request is headed.
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Terminal(&'a str),
    Events,
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    let path = path.trim_end_matches('/');
    if path == "/events" {
        return Route::Events;
    }
    match path.strip_prefix("/terminal/") {
        Some(id) if !id.is_empty() && !id.contains('/') => Route::Terminal(id),
        _ => Route::Unknown,
    }
}

/// The termhub server instance.
pub struct TermhubServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    auth: Arc<Authenticator>,
}

impl TermhubServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig) -> TermhubResult<Self> {
        let mut spawner =
            ShellSpawner::new(config.shell.clone(), config.channel, config.term.clone());
        if let Some(fallbacks) = &config.fallback_shells {
            spawner = spawner.with_fallbacks(fallbacks.clone());
        }

        if config.allowed_roots.is_empty() {
            info!("no allowed_roots configured, any existing directory may be used");
        }
        let policy: Arc<dyn PathPolicy> = Arc::new(RootJail::new(config.allowed_roots.clone()));

        let registry = Arc::new(SessionRegistry::new(
            spawner,
            policy,
            RegistryOptions {
                max_sessions: config.max_sessions,
                observer_buffer: config.observer_buffer,
                cols: config.cols,
                rows: config.rows,
                default_cwd: config.default_cwd.clone(),
            },
        ));

        let token = StaticToken::from_file(&config.token_file)?;
        let auth = Arc::new(Authenticator::new(
            NoAuthFlag::new(config.no_auth_flag.clone()),
            Arc::new(SessionKeyStore::new(config.session_key_ttl)),
            Arc::new(token),
        ));

        Ok(Self {
            config,
            registry,
            auth,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn auth(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    /// Bind the configured address, with TLS when a certificate is set.
    pub async fn bind(&self) -> TermhubResult<Listener> {
        let tls_config = match self.config.tls_paths() {
            Some((cert, key)) => Some(Arc::new(tls::load_tls_config(cert, key)?)),
            None => {
                warn!("no TLS certificate configured, serving plain WebSocket");
                None
            }
        };
        transport::start_listener(self.config.socket_addr(), tls_config).await
    }

    /// Accept connections until the listener stops.
    pub async fn run(self: Arc<Self>, mut listener: Listener) -> TermhubResult<()> {
        info!(addr = %listener.local_addr, "termhub server running");

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                conn = listener.incoming.recv() => {
                    let Some(conn) = conn else {
                        warn!("listener stopped");
                        break;
                    };
                    let server = self.clone();
                    tokio::spawn(async move { server.dispatch(conn).await });
                }
                _ = sweep.tick() => {
                    let swept = self.registry.sweep_closed(self.config.closed_retention).await;
                    if !swept.is_empty() {
                        debug!(count = swept.len(), "sweep removed closed sessions");
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(&self, mut conn: WebSocketConnection) {
        let path = conn.request.path.clone();
        match route(&path) {
            Route::Terminal(id) => {
                gateway::terminal::serve(conn, id, &self.registry, &self.auth).await
            }
            Route::Events => gateway::events::serve(conn, &self.registry, &self.auth).await,
            Route::Unknown => {
                warn!(remote = %conn.remote_addr, path = %path, "connection to unknown route");
                transport::websocket::close_with(
                    &mut conn.ws_stream,
                    CLOSE_SESSION_NOT_FOUND,
                    "unknown route",
                )
                .await;
            }
        }
    }

    /// Close every session. Called once on shutdown.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
