//! Pseudo channel: the capability a session uses to talk to its shell.
//!
//! Two backends exist. The PTY backend gives the child a real terminal
//! (line discipline, window size, job control). The pipe backend wires plain
//! stdin/stdout/stderr pipes and cannot carry geometry. The backend is picked
//! once, when the channel is started; nothing above this module branches on it.

use super::pipe::PipeChannel;
use super::pty::PtyChannel;
use serde::Deserialize;
use std::io;
use std::path::Path;
use termhub_core::TermhubResult;

/// Size of a single blocking read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Blocking output half of a channel.
///
/// Owned by exactly one session read loop and moved onto a blocking worker
/// for each call, so reads on the same channel never overlap.
pub trait ChannelReader: Send {
    /// Block until output is available. `Ok(None)` means end of stream.
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Input, control and teardown half of a channel.
pub trait PseudoChannel: Send {
    /// Hand out the output half. Returns `None` after the first call.
    fn take_reader(&mut self) -> Option<Box<dyn ChannelReader>>;

    /// Write raw bytes to the child's input.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Propagate a geometry change to the child.
    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()>;

    /// Whether `resize` reaches the child at all.
    fn supports_geometry(&self) -> bool;

    /// OS process id of the child, if still known.
    fn process_id(&self) -> Option<u32>;

    /// Ask the child to terminate and release OS handles. Idempotent.
    fn close(&mut self);
}

/// Which backend to use for new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// PTY on POSIX hosts, pipes elsewhere.
    #[default]
    Auto,
    Pty,
    Pipe,
}

impl ChannelKind {
    /// Resolve `Auto` for the current platform.
    pub fn resolve(self) -> ChannelKind {
        match self {
            ChannelKind::Auto if cfg!(unix) => ChannelKind::Pty,
            ChannelKind::Auto => ChannelKind::Pipe,
            other => other,
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ChannelKind::Auto),
            "pty" => Ok(ChannelKind::Pty),
            "pipe" => Ok(ChannelKind::Pipe),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

/// Everything needed to start a child process.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub program: &'a str,
    pub cwd: Option<&'a Path>,
    pub cols: u16,
    pub rows: u16,
    /// Value exported as `TERM`.
    pub term: &'a str,
}

/// Start `spec.program` on the backend selected by `kind`.
pub fn start(kind: ChannelKind, spec: &LaunchSpec<'_>) -> TermhubResult<Box<dyn PseudoChannel>> {
    match kind.resolve() {
        ChannelKind::Pipe => Ok(Box::new(PipeChannel::start(spec)?)),
        _ => Ok(Box::new(PtyChannel::start(spec)?)),
    }
}

/// Politely ask a detached process group to exit.
///
/// SIGHUP is what a real terminal sends on hangup; SIGTERM covers children
/// that ignore it. Neither is a hard kill.
#[cfg(unix)]
pub(crate) fn terminate_group(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    killpg(pgid, Signal::SIGHUP).map_err(io::Error::from)?;
    // The group may already be gone after SIGHUP.
    let _ = killpg(pgid, Signal::SIGTERM);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolves_per_platform() {
        let resolved = ChannelKind::Auto.resolve();
        if cfg!(unix) {
            assert_eq!(resolved, ChannelKind::Pty);
        } else {
            assert_eq!(resolved, ChannelKind::Pipe);
        }
        assert_eq!(ChannelKind::Pipe.resolve(), ChannelKind::Pipe);
    }

    #[test]
    fn parse_kind() {
        assert_eq!("pty".parse::<ChannelKind>(), Ok(ChannelKind::Pty));
        assert!("tmux".parse::<ChannelKind>().is_err());
    }
}
