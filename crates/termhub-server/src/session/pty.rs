//! PTY backend using portable-pty.
//!
//! Opens a pseudo-terminal pair, spawns the shell on the secondary side and
//! keeps only the primary side in the server. portable-pty runs the child
//! through `setsid`, so it leads its own process group and can be signalled
//! as a unit.

use super::channel::{ChannelReader, LaunchSpec, PseudoChannel, READ_CHUNK_SIZE};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use termhub_core::{TermhubError, TermhubResult};
use tracing::{debug, info, warn};

/// A shell attached to the primary side of a PTY.
pub struct PtyChannel {
    /// Primary side, kept for resize.
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyChannel {
    /// Open a PTY of the requested size and spawn `spec.program` on it.
    pub fn start(spec: &LaunchSpec<'_>) -> TermhubResult<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| TermhubError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(spec.program);
        if let Some(dir) = spec.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", spec.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermhubError::Spawn(format!("{}: {e}", spec.program)))?;
        // Close the secondary side in the server right away; the child holds
        // its own copy, and end-of-stream depends on it being the last one.
        drop(pair.slave);

        let pid = child.process_id();
        info!(program = spec.program, ?pid, cols = spec.cols, rows = spec.rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermhubError::Channel(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermhubError::Channel(format!("failed to take PTY writer: {e}")))?;

        Ok(Self {
            master: Some(pair.master),
            writer: Some(writer),
            reader: Some(reader),
            child: Some(child),
            pid,
        })
    }
}

impl PseudoChannel for PtyChannel {
    fn take_reader(&mut self) -> Option<Box<dyn ChannelReader>> {
        self.reader
            .take()
            .map(|inner| Box::new(PtyReader { inner }) as Box<dyn ChannelReader>)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "PTY closed"))?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "PTY closed"))?;
        // TIOCSWINSZ on the primary side; the kernel raises SIGWINCH in the
        // child's foreground group.
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn supports_geometry(&self) -> bool {
        true
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        {
            let signalled = match self.pid {
                Some(pid) => super::channel::terminate_group(pid),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no pid")),
            };
            if let Err(e) = signalled {
                debug!(error = %e, "could not signal PTY process group");
            }
        }
        #[cfg(not(unix))]
        {
            use portable_pty::ChildKiller;
            if let Err(e) = child.kill() {
                debug!(error = %e, "could not terminate PTY child");
            }
        }

        // Dropping the primary side hangs up the terminal once the read loop
        // lets go of its clone.
        self.writer.take();
        self.master.take();

        // Reap in the background; close never waits for the child.
        let pid = self.pid;
        let spawned = std::thread::Builder::new()
            .name("pty-reaper".into())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(?pid, exit = status.exit_code(), "PTY child reaped"),
                Err(e) => debug!(?pid, error = %e, "PTY child wait failed"),
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn PTY reaper thread");
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct PtyReader {
    inner: Box<dyn Read + Send>,
}

impl ChannelReader for PtyReader {
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            return match self.inner.read(&mut buf) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_hangup(&e) => Ok(None),
                Err(e) => Err(e),
            };
        }
    }
}

/// EIO on the primary side means every secondary descriptor is closed,
/// i.e. the child is gone.
#[cfg(unix)]
fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(_e: &io::Error) -> bool {
    false
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
