//! Server configuration: TOML file + CLI overrides.

use crate::session::ChannelKind;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termhub_core::{TermhubError, TermhubResult, DEFAULT_COLS, DEFAULT_ROWS};
use tracing::info;

/// Blocking threads kept free beyond one outstanding read per live session.
pub const BLOCKING_HEADROOM: usize = 8;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate. TLS is enabled when both `cert` and `key` are set.
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
    /// Seconds a closed session stays listed before it is swept.
    #[serde(default = "default_closed_retention")]
    pub closed_retention: u64,
    /// Bound on the blocking pool that runs channel reads. Must leave
    /// `BLOCKING_HEADROOM` threads beyond `max_sessions`.
    #[serde(default = "default_worker_threads_max")]
    pub worker_threads_max: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
            max_sessions: default_max_sessions(),
            observer_buffer: default_observer_buffer(),
            closed_retention: default_closed_retention(),
            worker_threads_max: default_worker_threads_max(),
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default)]
    pub shell: Option<String>,
    /// Replaces the built-in platform fallback list.
    #[serde(default)]
    pub fallback_shells: Option<Vec<String>>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub channel: ChannelKind,
    #[serde(default)]
    pub default_cwd: Option<String>,
    /// Working directories must live under one of these. Empty allows any.
    #[serde(default)]
    pub allowed_roots: Vec<String>,
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: None,
            fallback_shells: None,
            cols: default_cols(),
            rows: default_rows(),
            channel: ChannelKind::default(),
            default_cwd: None,
            allowed_roots: Vec::new(),
            term: default_term(),
        }
    }
}

/// `[auth]` section of the config TOML.
///
/// Relative paths are resolved against the directory holding the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_token_file")]
    pub token_file: String,
    #[serde(default = "default_no_auth_flag")]
    pub no_auth_flag: String,
    #[serde(default = "default_session_key_ttl")]
    pub session_key_ttl: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
            no_auth_flag: default_no_auth_flag(),
            session_key_ttl: default_session_key_ttl(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_max_sessions() -> usize {
    64
}
fn default_observer_buffer() -> usize {
    1024
}
fn default_closed_retention() -> u64 {
    600
}
fn default_worker_threads_max() -> usize {
    256
}
fn default_cols() -> u16 {
    DEFAULT_COLS
}
fn default_rows() -> u16 {
    DEFAULT_ROWS
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_token_file() -> String {
    "admin_token.txt".to_string()
}
fn default_no_auth_flag() -> String {
    "global_flags/no_auth".to_string()
}
fn default_session_key_ttl() -> u64 {
    60
}

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub max_sessions: Option<usize>,
    pub shell: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub observer_buffer: usize,
    pub closed_retention: Duration,
    pub worker_threads_max: usize,
    pub shell: Option<String>,
    pub fallback_shells: Option<Vec<String>>,
    pub cols: u16,
    pub rows: u16,
    pub channel: ChannelKind,
    pub default_cwd: Option<PathBuf>,
    pub allowed_roots: Vec<PathBuf>,
    pub term: String,
    pub token_file: PathBuf,
    pub no_auth_flag: PathBuf,
    pub session_key_ttl: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; a malformed one is an error.
    pub fn load(config_path: &Path, overrides: Overrides) -> TermhubResult<Self> {
        let expanded = expand_tilde(config_path);
        let file_config = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)?;
            toml::from_str::<ConfigFile>(&content)
                .map_err(|e| TermhubError::Config(format!("config parse error: {e}")))?
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        let base_dir = expanded
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(termhub_dir);
        Self::resolve(file_config, &base_dir, overrides)
    }

    /// Merge a parsed file with overrides. Relative auth paths are joined
    /// onto `base_dir`.
    pub fn resolve(file: ConfigFile, base_dir: &Path, overrides: Overrides) -> TermhubResult<Self> {
        let ConfigFile {
            server,
            terminal,
            auth,
        } = file;

        let bind_str = overrides.bind.unwrap_or(server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| TermhubError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;

        let cert = overrides.cert.or(server.cert);
        let key = overrides.key.or(server.key);
        if cert.is_some() != key.is_some() {
            return Err(TermhubError::Config(
                "TLS needs both a certificate and a key".into(),
            ));
        }

        if terminal.cols == 0 || terminal.rows == 0 {
            return Err(TermhubError::Config(format!(
                "terminal geometry must be positive, got {}x{}",
                terminal.cols, terminal.rows
            )));
        }

        // Every live session parks one blocking thread on its read.
        let max_sessions = overrides.max_sessions.unwrap_or(server.max_sessions);
        let worker_threads_max = server.worker_threads_max;
        if worker_threads_max < max_sessions.saturating_add(BLOCKING_HEADROOM) {
            return Err(TermhubError::Config(format!(
                "worker_threads_max ({worker_threads_max}) must be at least max_sessions ({max_sessions}) + {BLOCKING_HEADROOM}"
            )));
        }

        let resolve_in = |raw: &str| {
            let path = expand_tilde_str(raw);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        };

        Ok(Self {
            bind,
            port: overrides.port.unwrap_or(server.port),
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            max_sessions,
            observer_buffer: server.observer_buffer.max(1),
            closed_retention: Duration::from_secs(server.closed_retention),
            worker_threads_max,
            shell: overrides.shell.or(terminal.shell),
            fallback_shells: terminal.fallback_shells,
            cols: terminal.cols,
            rows: terminal.rows,
            channel: terminal.channel,
            default_cwd: terminal.default_cwd.as_deref().map(expand_tilde_str),
            allowed_roots: terminal
                .allowed_roots
                .iter()
                .map(|r| expand_tilde_str(r))
                .collect(),
            term: terminal.term,
            token_file: resolve_in(&auth.token_file),
            no_auth_flag: resolve_in(&auth.no_auth_flag),
            session_key_ttl: Duration::from_secs(auth.session_key_ttl),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Certificate and key, when TLS is configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        Some((self.cert_path.as_deref()?, self.key_path.as_deref()?))
    }
}

/// `~/.termhub`, the home of config, token and generated certificates.
pub fn termhub_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".termhub")
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
