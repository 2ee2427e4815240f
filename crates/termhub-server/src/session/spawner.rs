//! Shell resolution and spawning with a fallback chain.
//!
//! Candidates are tried in order: the configured shell (when it is present
//! and executable), the host's shell variable, then a fixed platform list.
//! The first candidate that starts wins.

use super::channel::{self, ChannelKind, LaunchSpec, PseudoChannel};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Platform fallback shells, tried last. Missing paths are skipped.
#[cfg(unix)]
pub const FALLBACK_SHELLS: &[&str] = &[
    "/bin/sh",
    "/system/bin/sh",
    "/data/data/com.termux/files/usr/bin/sh",
];

#[cfg(not(unix))]
pub const FALLBACK_SHELLS: &[&str] = &["cmd.exe", "powershell.exe"];

/// Environment variable naming the host's preferred shell.
#[cfg(unix)]
const SHELL_VAR: &str = "SHELL";
#[cfg(not(unix))]
const SHELL_VAR: &str = "COMSPEC";

/// Every candidate failed to start.
#[derive(Debug, Clone)]
pub struct SpawnFailure {
    /// `(program, error)` for each attempt, in order.
    pub attempts: Vec<(String, String)>,
}

impl SpawnFailure {
    /// The line placed in a failed session's history.
    pub fn diagnostic_line(&self) -> String {
        let tried: Vec<&str> = self.attempts.iter().map(|(p, _)| p.as_str()).collect();
        if tried.is_empty() {
            "Error: Failed to start shell process: no shell candidates found. Please check the terminal shell setting.\r\n".to_string()
        } else {
            format!(
                "Error: Failed to start shell process (tried {}). Please check the terminal shell setting.\r\n",
                tried.join(", ")
            )
        }
    }
}

impl fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no shell could be started")?;
        for (program, error) in &self.attempts {
            write!(f, "; {program}: {error}")?;
        }
        Ok(())
    }
}

/// A started channel plus the program it runs.
pub struct Spawned {
    pub channel: Box<dyn PseudoChannel>,
    pub program: String,
}

impl fmt::Debug for Spawned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawned").field("program", &self.program).finish()
    }
}

/// Resolves which shell to run and starts it on a pseudo channel.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    configured: Option<String>,
    env_shell: Option<String>,
    fallbacks: Vec<String>,
    kind: ChannelKind,
    term: String,
}

impl ShellSpawner {
    /// Build a spawner that reads the host shell variable now.
    pub fn new(configured: Option<String>, kind: ChannelKind, term: impl Into<String>) -> Self {
        Self {
            configured: configured.filter(|s| !s.trim().is_empty()),
            env_shell: std::env::var(SHELL_VAR).ok().filter(|s| !s.trim().is_empty()),
            fallbacks: FALLBACK_SHELLS.iter().map(|s| s.to_string()).collect(),
            kind,
            term: term.into(),
        }
    }

    /// Override the host shell variable (tests, embedding).
    pub fn with_env_shell(mut self, shell: Option<String>) -> Self {
        self.env_shell = shell;
        self
    }

    /// Replace the platform fallback list.
    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Candidates in the order they will be tried, without duplicates.
    pub fn candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |candidate: &str| {
            if !out.iter().any(|c| c == candidate) {
                out.push(candidate.to_string());
            }
        };

        if let Some(shell) = &self.configured {
            if is_executable(Path::new(shell)) {
                push(shell);
            } else {
                warn!(shell = %shell, "configured shell is not executable, skipping");
            }
        }
        if let Some(shell) = &self.env_shell {
            push(shell);
        }
        for fallback in &self.fallbacks {
            // Bare names are left to the OS search path.
            let path = Path::new(fallback);
            if path.components().count() == 1 || path.exists() {
                push(fallback);
            }
        }
        out
    }

    /// Start the first candidate that spawns.
    pub fn spawn(&self, cwd: Option<&Path>, cols: u16, rows: u16) -> Result<Spawned, SpawnFailure> {
        let mut attempts = Vec::new();
        for program in self.candidates() {
            let spec = LaunchSpec {
                program: &program,
                cwd,
                cols,
                rows,
                term: &self.term,
            };
            match channel::start(self.kind, &spec) {
                Ok(channel) => {
                    if !attempts.is_empty() {
                        info!(program = %program, failed = attempts.len(), "fell back to shell");
                    }
                    return Ok(Spawned { channel, program });
                }
                Err(e) => {
                    warn!(program = %program, error = %e, "shell spawn failed");
                    attempts.push((program, e.to_string()));
                }
            }
        }
        Err(SpawnFailure { attempts })
    }
}

/// Whether `path` names something we may try to execute.
///
/// Bare program names are accepted and resolved by the OS at spawn time.
fn is_executable(path: &Path) -> bool {
    if path.components().count() == 1 {
        return true;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
