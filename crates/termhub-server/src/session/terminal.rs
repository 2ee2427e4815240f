//! A live terminal session.
//!
//! One session owns one pseudo channel, a capped output history and the set
//! of observers currently attached. Output flows from a single read loop:
//! each blocking read runs on the blocking pool, and the result is decoded,
//! appended to history and fanned out before the next read is issued.
//!
//! Input and resize requests go the other way through a queue drained by a
//! dedicated writer thread. A child that stops reading stalls only that
//! thread; the session lock is never held across a channel write.

use super::channel::{ChannelReader, PseudoChannel};
use super::history::History;
use super::spawner::ShellSpawner;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use termhub_core::SessionSummary;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Appended once when a session ends, whatever ended it.
pub const TERMINATED_NOTICE: &str = "\r\n\x1b[1;31m[Process terminated]\x1b[0m\r\n";

/// Default depth of each observer's outbound queue.
pub const DEFAULT_OBSERVER_BUFFER: usize = 1024;

pub type ObserverId = u64;

/// Parameters for a new session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: String,
    /// Directory the shell starts in. `None` inherits the server's.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Queue depth per observer before it counts as lagging.
    pub observer_buffer: usize,
}

/// What an observer gets when it attaches.
#[derive(Debug)]
pub struct Attachment {
    pub observer_id: ObserverId,
    /// Retained output, oldest first, captured atomically with registration.
    pub history: Vec<String>,
    /// Output produced after `history`. Ends when the session closes.
    pub output: mpsc::Receiver<String>,
}

struct Observer {
    id: ObserverId,
    tx: mpsc::Sender<String>,
}

/// A request for the writer thread, applied in the order it was queued.
#[derive(Debug)]
enum ChannelCommand {
    Input(Vec<u8>),
    Resize(u16, u16),
}

/// The session's end of a channel owned by its writer thread.
struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    closing: Arc<AtomicBool>,
    process_id: Option<u32>,
    supports_geometry: bool,
}

impl ChannelHandle {
    /// Move `channel` onto a new writer thread.
    fn spawn(session_id: &str, channel: Box<dyn PseudoChannel>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let process_id = channel.process_id();
        let supports_geometry = channel.supports_geometry();
        let id = session_id.to_string();
        let flag = closing.clone();
        std::thread::Builder::new()
            .name("session-writer".into())
            .spawn(move || run_writer(id, channel, rx, flag))?;
        Ok(Self {
            commands: tx,
            closing,
            process_id,
            supports_geometry,
        })
    }

    fn send(&self, command: ChannelCommand) {
        // A closed queue means the writer already quit; the read loop will
        // see end of stream.
        let _ = self.commands.send(command);
    }

    /// Stop the writer and signal the child without waiting on either.
    ///
    /// A write stuck on a child that stopped reading is released once the
    /// signalled child exits; the writer then closes the channel itself.
    fn shutdown(self, session_id: &str) {
        self.closing.store(true, Ordering::Release);
        drop(self.commands);
        #[cfg(unix)]
        {
            if let Some(pid) = self.process_id {
                if let Err(e) = super::channel::terminate_group(pid) {
                    debug!(session_id, pid, error = %e, "could not signal process group");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (session_id, self.process_id);
        }
    }
}

fn run_writer(
    session_id: String,
    mut channel: Box<dyn PseudoChannel>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    closing: Arc<AtomicBool>,
) {
    while let Some(command) = commands.blocking_recv() {
        if closing.load(Ordering::Acquire) {
            break;
        }
        match command {
            ChannelCommand::Input(bytes) => {
                if let Err(e) = channel.write(&bytes) {
                    debug!(session_id = %session_id, error = %e, "write to channel failed");
                }
            }
            ChannelCommand::Resize(cols, rows) => {
                if let Err(e) = channel.resize(cols, rows) {
                    warn!(session_id = %session_id, cols, rows, error = %e, "resize failed");
                }
            }
        }
    }
    channel.close();
    debug!(session_id = %session_id, "writer finished");
}

struct SessionState {
    cols: u16,
    rows: u16,
    channel: Option<ChannelHandle>,
    history: History,
    observers: Vec<Observer>,
    next_observer_id: ObserverId,
    closed: bool,
    closed_at: Option<Instant>,
}

impl SessionState {
    fn append(&mut self, session_id: &str, chunk: String) {
        self.broadcast(session_id, &chunk);
        self.history.push(chunk);
    }

    /// Deliver to every observer; a failed send detaches only that observer.
    fn broadcast(&mut self, session_id: &str, chunk: &str) {
        self.observers.retain(|observer| {
            match observer.tx.try_send(chunk.to_owned()) {
                Ok(()) => true,
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id, observer = observer.id, "observer gone, detaching");
                    false
                }
                Err(TrySendError::Full(_)) => {
                    warn!(session_id, observer = observer.id, "observer lagging, detaching");
                    false
                }
            }
        });
    }
}

/// A shell process shared by any number of observers.
pub struct TerminalSession {
    id: String,
    created_at: SystemTime,
    cwd: Option<PathBuf>,
    observer_buffer: usize,
    state: Mutex<SessionState>,
}

impl TerminalSession {
    /// Spawn a shell for `params` and start reading from it.
    ///
    /// Never fails: if no shell starts, the session is returned already
    /// closed with a diagnostic line in its history. Must be called from
    /// within a tokio runtime.
    pub fn start(params: SessionParams, spawner: &ShellSpawner) -> Arc<Self> {
        match spawner.spawn(params.cwd.as_deref(), params.cols, params.rows) {
            Ok(spawned) => {
                info!(
                    session_id = %params.id,
                    program = %spawned.program,
                    pid = ?spawned.channel.process_id(),
                    "shell started"
                );
                Self::with_channel(params, spawned.channel)
            }
            Err(failure) => {
                error!(session_id = %params.id, error = %failure, "no shell could be started");
                Self::failed(params, failure.diagnostic_line())
            }
        }
    }

    /// Wrap an already started channel and run its read loop.
    pub fn with_channel(params: SessionParams, mut channel: Box<dyn PseudoChannel>) -> Arc<Self> {
        let reader = channel.take_reader();
        let handle = match ChannelHandle::spawn(&params.id, channel) {
            Ok(handle) => Some(handle),
            Err(e) => {
                // The channel was dropped with the closure, which closes it.
                error!(session_id = %params.id, error = %e, "failed to start writer thread");
                None
            }
        };
        let usable = handle.is_some();
        let session = Arc::new(Self::build(params, handle, None));
        match reader {
            Some(reader) if usable => {
                tokio::spawn(session.clone().read_loop(reader));
            }
            _ => {
                warn!(session_id = %session.id, "channel unusable, closing");
                session.close();
            }
        }
        session
    }

    /// A session that never ran, carrying one explanatory line.
    pub fn failed(params: SessionParams, diagnostic: String) -> Arc<Self> {
        Arc::new(Self::build(params, None, Some(diagnostic)))
    }

    fn build(
        params: SessionParams,
        channel: Option<ChannelHandle>,
        diagnostic: Option<String>,
    ) -> Self {
        let mut history = History::default();
        let closed = diagnostic.is_some();
        if let Some(line) = diagnostic {
            history.push(line);
        }
        Self {
            id: params.id,
            created_at: SystemTime::now(),
            cwd: params.cwd,
            observer_buffer: params.observer_buffer.max(1),
            state: Mutex::new(SessionState {
                cols: params.cols,
                rows: params.rows,
                channel,
                history,
                observers: Vec::new(),
                next_observer_id: 1,
                closed,
                closed_at: closed.then(Instant::now),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_loop(self: Arc<Self>, mut reader: Box<dyn ChannelReader>) {
        let mut decoder = Utf8Stream::default();
        loop {
            let joined = tokio::task::spawn_blocking(move || {
                let result = reader.read_chunk();
                (reader, result)
            })
            .await;
            let result = match joined {
                Ok((returned, result)) => {
                    reader = returned;
                    result
                }
                Err(e) => {
                    error!(session_id = %self.id, error = %e, "read worker failed");
                    break;
                }
            };

            if self.is_closed() {
                break;
            }
            match result {
                Ok(Some(bytes)) if !bytes.is_empty() => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() {
                        self.publish(text);
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    debug!(
                        session_id = %self.id,
                        error = %e,
                        "channel read failed, treating as end of stream"
                    );
                    break;
                }
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            self.publish(tail);
        }
        debug!(session_id = %self.id, "read loop finished");
        self.close();
    }

    fn publish(&self, text: String) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.append(&self.id, text);
    }

    /// Register an observer and capture the history it must replay first.
    ///
    /// On a closed session the observer is not registered and its output
    /// stream ends right after the history.
    pub fn attach(&self) -> Attachment {
        let (tx, rx) = mpsc::channel(self.observer_buffer);
        let mut state = self.lock();
        let observer_id = state.next_observer_id;
        state.next_observer_id += 1;
        let history = state.history.snapshot();
        if !state.closed {
            state.observers.push(Observer { id: observer_id, tx });
            info!(
                session_id = %self.id,
                observer = observer_id,
                observers = state.observers.len(),
                "observer attached"
            );
        }
        Attachment {
            observer_id,
            history,
            output: rx,
        }
    }

    /// Remove an observer. Returns whether it was still attached.
    pub fn detach(&self, observer_id: ObserverId) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|o| o.id != observer_id);
        let removed = state.observers.len() != before;
        if removed {
            info!(
                session_id = %self.id,
                observer = observer_id,
                observers = state.observers.len(),
                "observer detached"
            );
        }
        removed
    }

    /// Queue keystrokes for the shell. Ignored once closed.
    ///
    /// Never blocks. Write errors are logged by the writer; a dead channel
    /// shows up as end of stream on the next read.
    pub fn write_input(&self, text: &str) {
        let state = self.lock();
        if state.closed {
            return;
        }
        if let Some(channel) = state.channel.as_ref() {
            channel.send(ChannelCommand::Input(text.as_bytes().to_vec()));
        }
    }

    /// Record new geometry and queue it for the channel if it can use it.
    pub fn resize(&self, cols: u16, rows: u16) {
        let mut state = self.lock();
        state.cols = cols;
        state.rows = rows;
        if state.closed {
            return;
        }
        if let Some(channel) = state.channel.as_ref().filter(|c| c.supports_geometry) {
            channel.send(ChannelCommand::Resize(cols, rows));
        }
    }

    /// End the session. Idempotent.
    ///
    /// The first call appends and broadcasts the termination notice, drops
    /// every observer (their streams end after the notice), and asks the
    /// child to terminate without waiting for it.
    pub fn close(&self) {
        let channel = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.append(&self.id, TERMINATED_NOTICE.to_string());
            state.closed = true;
            state.closed_at = Some(Instant::now());
            state.observers.clear();
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel.shutdown(&self.id);
        }
        info!(session_id = %self.id, "session closed");
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// How long ago the session closed, if it has.
    pub fn closed_for(&self) -> Option<Duration> {
        self.lock().closed_at.map(|at| at.elapsed())
    }

    /// Current `(cols, rows)`.
    pub fn geometry(&self) -> (u16, u16) {
        let state = self.lock();
        (state.cols, state.rows)
    }

    pub fn history(&self) -> Vec<String> {
        self.lock().history.snapshot()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            cwd: self.cwd.as_ref().map(|p| p.display().to_string()),
            closed: self.is_closed(),
        }
    }
}

/// Incremental UTF-8 decoding across read boundaries.
///
/// A multi-byte character split between two reads is held back until the
/// rest arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);
        let keep = incomplete_tail(&bytes);
        self.pending = bytes.split_off(bytes.len() - keep);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
