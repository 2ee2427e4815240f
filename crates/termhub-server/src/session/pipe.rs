//! Pipe backend for hosts without a usable PTY.
//!
//! The child gets ordinary stdin/stdout/stderr pipes. Two pump threads drain
//! stdout and stderr into one queue, so output arrives as a single stream in
//! roughly the order it was produced. Pipes carry no geometry: `resize` is a
//! no-op here and the session keeps the numbers for accounting only.

use super::channel::{ChannelReader, LaunchSpec, PseudoChannel, READ_CHUNK_SIZE};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use termhub_core::{TermhubError, TermhubResult};
use tracing::{debug, info, warn};

/// A shell attached through plain pipes.
pub struct PipeChannel {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output: Option<mpsc::Receiver<Vec<u8>>>,
    pid: u32,
}

impl PipeChannel {
    /// Spawn `spec.program` with piped standard streams.
    pub fn start(spec: &LaunchSpec<'_>) -> TermhubResult<Self> {
        let mut cmd = Command::new(spec.program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", spec.term);
        if let Some(dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TermhubError::Spawn(format!("{}: {e}", spec.program)))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            spawn_pump("pipe-stdout", stdout, tx.clone())?;
        }
        if let Some(stderr) = stderr {
            spawn_pump("pipe-stderr", stderr, tx)?;
        }

        info!(program = spec.program, pid, "pipe shell spawned");

        Ok(Self {
            stdin: child.stdin.take(),
            child: Some(child),
            output: Some(rx),
            pid,
        })
    }
}

/// Copy one child stream into the shared queue until it closes.
fn spawn_pump<R: Read + Send + 'static>(
    name: &str,
    mut source: R,
    tx: mpsc::Sender<Vec<u8>>,
) -> TermhubResult<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })
        .map(|_| ())
        .map_err(|e| TermhubError::Channel(format!("failed to spawn pump thread: {e}")))
}

impl PseudoChannel for PipeChannel {
    fn take_reader(&mut self) -> Option<Box<dyn ChannelReader>> {
        self.output
            .take()
            .map(|rx| Box::new(PipeReader { rx }) as Box<dyn ChannelReader>)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> io::Result<()> {
        Ok(())
    }

    fn supports_geometry(&self) -> bool {
        false
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        // EOF on stdin is enough for most shells.
        self.stdin.take();

        #[cfg(unix)]
        {
            if let Err(e) = super::channel::terminate_group(self.pid) {
                debug!(pid = self.pid, error = %e, "could not signal pipe process group");
            }
        }
        #[cfg(not(unix))]
        {
            // Console processes have no softer stop than TerminateProcess
            // when they are not attached to a console.
            if let Err(e) = child.kill() {
                debug!(pid = self.pid, error = %e, "could not terminate pipe child");
            }
        }

        let pid = self.pid;
        let spawned = std::thread::Builder::new()
            .name("pipe-reaper".into())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, %status, "pipe child reaped"),
                Err(e) => debug!(pid, error = %e, "pipe child wait failed"),
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn pipe reaper thread");
        }
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelReader for PipeReader {
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        // Both pumps gone means both streams hit EOF.
        Ok(self.rx.recv().ok())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(program: &str) -> LaunchSpec<'_> {
        LaunchSpec {
            program,
            cwd: None,
            cols: 80,
            rows: 24,
            term: "dumb",
        }
    }

    fn read_until_eof(reader: &mut Box<dyn ChannelReader>) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn echoes_through_pipes() {
        let mut channel = PipeChannel::start(&spec("/bin/sh")).unwrap();
        let mut reader = channel.take_reader().unwrap();
        channel.write(b"echo piped-hello\nexit\n").unwrap();
        let out = read_until_eof(&mut reader);
        assert!(out.contains("piped-hello"), "got {out:?}");
    }

    #[test]
    fn stderr_is_merged() {
        let mut channel = PipeChannel::start(&spec("/bin/sh")).unwrap();
        let mut reader = channel.take_reader().unwrap();
        channel.write(b"echo to-stderr 1>&2\nexit\n").unwrap();
        let out = read_until_eof(&mut reader);
        assert!(out.contains("to-stderr"), "got {out:?}");
    }

    #[test]
    fn resize_is_accepted_but_not_propagated() {
        let mut channel = PipeChannel::start(&spec("/bin/sh")).unwrap();
        assert!(!channel.supports_geometry());
        assert!(channel.resize(120, 40).is_ok());
        channel.close();
    }

    #[test]
    fn close_ends_the_stream() {
        let mut channel = PipeChannel::start(&spec("/bin/sh")).unwrap();
        let mut reader = channel.take_reader().unwrap();
        channel.close();
        channel.close();
        read_until_eof(&mut reader);
        assert!(channel.write(b"echo late\n").is_err());
    }

    #[test]
    fn missing_program_fails_to_start() {
        assert!(PipeChannel::start(&spec("/definitely/not/a/shell")).is_err());
    }
}
