//! Session registry.
//!
//! Owns every session by id, creates and destroys them, and fans lifecycle
//! events out to event observers. Sessions never point back at the registry;
//! everything goes through id lookup.

use super::spawner::ShellSpawner;
use super::terminal::{SessionParams, TerminalSession, DEFAULT_OBSERVER_BUFFER};
use super::workdir::PathPolicy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use termhub_core::messages::{SessionCreated, SessionRef};
use termhub_core::{ServerMessage, SessionSummary, TermhubError, TermhubResult};
use termhub_core::{DEFAULT_COLS, DEFAULT_ROWS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry-wide knobs.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Upper bound on sessions that are still running.
    pub max_sessions: usize,
    pub observer_buffer: usize,
    pub cols: u16,
    pub rows: u16,
    /// Where shells start when no usable cwd is requested. Falls back to
    /// the user's home directory.
    pub default_cwd: Option<PathBuf>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            default_cwd: None,
        }
    }
}

/// What an event observer gets when it subscribes.
#[derive(Debug)]
pub struct EventSubscription {
    pub observer_id: u64,
    /// Sessions present at subscription time, in creation order.
    pub sessions: Vec<SessionSummary>,
    /// `create` and `kill` events after the snapshot.
    pub events: mpsc::Receiver<ServerMessage>,
}

struct Entry {
    seq: u64,
    session: Arc<TerminalSession>,
}

#[derive(Default)]
struct EventHub {
    observers: Vec<(u64, mpsc::Sender<ServerMessage>)>,
    next_id: u64,
}

/// Owns all sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    spawner: ShellSpawner,
    policy: Arc<dyn PathPolicy>,
    options: RegistryOptions,
    events: Mutex<EventHub>,
}

impl SessionRegistry {
    pub fn new(
        spawner: ShellSpawner,
        policy: Arc<dyn PathPolicy>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            spawner,
            policy,
            options,
            events: Mutex::new(EventHub::default()),
        }
    }

    /// Create a session and start its shell before returning.
    ///
    /// A refused `cwd` falls back to the default directory, and a shell that
    /// fails to start still yields a (closed) session. Running out of
    /// capacity is the only error in normal operation.
    ///
    /// The shell is spawned on the blocking pool with no registry lock held;
    /// capacity is checked again when the session is inserted.
    pub async fn create_session(&self, cwd: Option<&str>) -> TermhubResult<String> {
        let id = {
            let sessions = self.sessions.read().await;
            self.check_capacity(&sessions)?;
            loop {
                let candidate = generate_session_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            }
        };

        let params = SessionParams {
            id: id.clone(),
            cwd: self.resolve_cwd(cwd),
            cols: self.options.cols,
            rows: self.options.rows,
            observer_buffer: self.options.observer_buffer,
        };
        let spawner = self.spawner.clone();
        let session =
            tokio::task::spawn_blocking(move || TerminalSession::start(params, &spawner))
                .await
                .map_err(|e| TermhubError::Spawn(format!("spawn task failed: {e}")))?;

        let mut sessions = self.sessions.write().await;
        if let Err(e) = self.check_capacity(&sessions) {
            session.close();
            return Err(e);
        }
        if sessions.contains_key(&id) {
            session.close();
            return Err(TermhubError::Spawn(format!("session id collision: {id}")));
        }
        let created = SessionCreated {
            id: id.clone(),
            cwd: session.cwd().map(|p| p.display().to_string()),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        sessions.insert(id.clone(), Entry { seq, session });
        info!(session_id = %id, cwd = ?created.cwd, "session created");

        // Emitted under the write lock so subscribers never see a session
        // both in their snapshot and as a later create event.
        self.emit(ServerMessage::Create(created));
        Ok(id)
    }

    fn check_capacity(&self, sessions: &HashMap<String, Entry>) -> TermhubResult<()> {
        let live = sessions.values().filter(|e| !e.session.is_closed()).count();
        if live >= self.options.max_sessions {
            warn!(live, max = self.options.max_sessions, "session capacity reached");
            return Err(TermhubError::CapacityReached(format!(
                "max sessions ({}) reached",
                self.options.max_sessions
            )));
        }
        Ok(())
    }

    fn resolve_cwd(&self, requested: Option<&str>) -> Option<PathBuf> {
        if let Some(raw) = requested.filter(|s| !s.trim().is_empty()) {
            match self.policy.check(Path::new(raw)) {
                Ok(dir) => return Some(dir),
                Err(e) => {
                    warn!(requested = raw, error = %e, "working directory refused, using default")
                }
            }
        }
        self.options.default_cwd.clone().or_else(dirs::home_dir)
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(id).map(|e| e.session.clone())
    }

    /// Like `get_session`, but an unknown id is an error.
    pub async fn require_session(&self, id: &str) -> TermhubResult<Arc<TerminalSession>> {
        self.get_session(id)
            .await
            .ok_or_else(|| TermhubError::SessionNotFound(id.to_string()))
    }

    /// Remove and close a session. Returns `false` for unknown ids.
    pub async fn kill_session(&self, id: &str) -> bool {
        // Out of the map first so nobody attaches to a dying session.
        let removed = self.sessions.write().await.remove(id);
        let Some(entry) = removed else {
            debug!(session_id = %id, "kill for unknown session ignored");
            return false;
        };
        entry.session.close();
        info!(session_id = %id, "session killed");
        self.emit(ServerMessage::Kill(SessionRef { id: id.to_string() }));
        true
    }

    /// All sessions in creation order.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<&Entry> = sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.session.summary()).collect()
    }

    /// Register an event observer along with a consistent snapshot.
    pub async fn subscribe(&self) -> EventSubscription {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<&Entry> = sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        let snapshot = entries.iter().map(|e| e.session.summary()).collect();

        let (tx, rx) = mpsc::channel(self.options.observer_buffer.max(1));
        let mut hub = self.hub();
        hub.next_id += 1;
        let observer_id = hub.next_id;
        hub.observers.push((observer_id, tx));
        debug!(observer = observer_id, observers = hub.observers.len(), "event observer attached");

        EventSubscription {
            observer_id,
            sessions: snapshot,
            events: rx,
        }
    }

    pub fn unsubscribe(&self, observer_id: u64) {
        let mut hub = self.hub();
        hub.observers.retain(|(id, _)| *id != observer_id);
        debug!(observer = observer_id, observers = hub.observers.len(), "event observer detached");
    }

    /// Remove sessions closed for at least `retention`.
    ///
    /// Returns the removed ids. Each one gets a `kill` event.
    pub async fn sweep_closed(&self, retention: Duration) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, entry| match entry.session.closed_for() {
                Some(age) if age >= retention => {
                    removed.push(id.clone());
                    false
                }
                _ => true,
            });
        }
        for id in &removed {
            info!(session_id = %id, "closed session swept");
            self.emit(ServerMessage::Kill(SessionRef { id: id.clone() }));
        }
        removed
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Entry> = self.sessions.write().await.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.session.close();
        }
        info!(count, "all sessions closed");
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn hub(&self) -> MutexGuard<'_, EventHub> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Best-effort delivery to every event observer.
    fn emit(&self, event: ServerMessage) {
        self.hub().observers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                debug!(observer = *id, "event observer gone, detaching");
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(observer = *id, "event observer lagging, detaching");
                false
            }
        });
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::channel::ChannelKind;
    use crate::session::terminal::TERMINATED_NOTICE;
    use crate::session::workdir::RootJail;

    /// A spawner that can never start anything.
    fn broken_spawner() -> ShellSpawner {
        ShellSpawner::new(None, ChannelKind::Pipe, "dumb")
            .with_env_shell(Some("/no/such/shell".into()))
            .with_fallbacks(vec![])
    }

    fn registry_with(spawner: ShellSpawner, options: RegistryOptions) -> SessionRegistry {
        SessionRegistry::new(spawner, Arc::new(RootJail::unrestricted()), options)
    }

    async fn next_event(sub: &mut EventSubscription) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), sub.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    #[tokio::test]
    async fn ids_are_unique_and_listed_in_creation_order() {
        let registry = registry_with(broken_spawner(), RegistryOptions::default());
        let a = registry.create_session(None).await.unwrap();
        let b = registry.create_session(None).await.unwrap();
        let c = registry.create_session(None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);

        let ids: Vec<String> = registry.list_sessions().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[tokio::test]
    async fn spawn_failure_does_not_fail_create() {
        let registry = registry_with(broken_spawner(), RegistryOptions::default());
        let id = registry.create_session(None).await.unwrap();
        let session = registry.get_session(&id).await.unwrap();
        assert!(session.is_closed());
        assert!(session.history()[0].starts_with("Error: Failed to start shell process"));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = registry_with(broken_spawner(), RegistryOptions::default());
        let id = registry.create_session(None).await.unwrap();
        assert!(registry.require_session(&id).await.is_ok());
        assert!(matches!(
            registry.require_session("nope").await,
            Err(TermhubError::SessionNotFound(id)) if id == "nope"
        ));
    }

    #[tokio::test]
    async fn refused_cwd_falls_back_to_default() {
        let home = tempfile::tempdir().unwrap();
        let home_path = home.path().canonicalize().unwrap();
        let options = RegistryOptions {
            default_cwd: Some(home_path.clone()),
            ..RegistryOptions::default()
        };
        let registry = registry_with(broken_spawner(), options);

        let id = registry.create_session(Some("/definitely/not/here")).await.unwrap();
        let session = registry.get_session(&id).await.unwrap();
        assert_eq!(session.cwd(), Some(home_path.as_path()));
    }

    #[tokio::test]
    async fn jailed_cwd_outside_roots_falls_back() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let default = root.path().canonicalize().unwrap();
        let registry = SessionRegistry::new(
            broken_spawner(),
            Arc::new(RootJail::new([root.path().to_path_buf()])),
            RegistryOptions {
                default_cwd: Some(default.clone()),
                ..RegistryOptions::default()
            },
        );

        let id = registry
            .create_session(outside.path().to_str())
            .await
            .unwrap();
        let session = registry.get_session(&id).await.unwrap();
        assert_eq!(session.cwd(), Some(default.as_path()));
    }

    #[tokio::test]
    async fn events_follow_the_snapshot() {
        let registry = registry_with(broken_spawner(), RegistryOptions::default());
        let before = registry.create_session(None).await.unwrap();

        let mut sub = registry.subscribe().await;
        assert_eq!(sub.sessions.len(), 1);
        assert_eq!(sub.sessions[0].id, before);

        let after = registry.create_session(None).await.unwrap();
        match next_event(&mut sub).await {
            ServerMessage::Create(created) => assert_eq!(created.id, after),
            other => panic!("expected create, got {other:?}"),
        }

        assert!(registry.kill_session(&before).await);
        assert_eq!(
            next_event(&mut sub).await,
            ServerMessage::Kill(SessionRef { id: before.clone() })
        );

        // Unknown ids are a silent no-op.
        assert!(!registry.kill_session(&before).await);
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_event_observer_is_detached() {
        let registry = registry_with(broken_spawner(), RegistryOptions::default());
        let gone = registry.subscribe().await;
        let mut alive = registry.subscribe().await;
        drop(gone);

        let id = registry.create_session(None).await.unwrap();
        assert!(matches!(next_event(&mut alive).await, ServerMessage::Create(c) if c.id == id));
        assert_eq!(registry.hub().observers.len(), 1);

        registry.unsubscribe(alive.observer_id);
        assert!(registry.hub().observers.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_closed_sessions() {
        let registry = registry_with(broken_spawner(), RegistryOptions::default());
        let id = registry.create_session(None).await.unwrap();
        let mut sub = registry.subscribe().await;

        assert!(registry.sweep_closed(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(registry.sweep_closed(Duration::ZERO).await, vec![id.clone()]);
        assert_eq!(registry.count().await, 0);
        assert_eq!(next_event(&mut sub).await, ServerMessage::Kill(SessionRef { id }));
    }

    #[cfg(unix)]
    mod shell {
        use super::*;

        fn sh(kind: ChannelKind) -> ShellSpawner {
            ShellSpawner::new(Some("/bin/sh".into()), kind, "dumb")
        }

        async fn output_until(
            output: &mut mpsc::Receiver<String>,
            needle: &str,
        ) -> String {
            let mut seen = String::new();
            tokio::time::timeout(Duration::from_secs(10), async {
                while !seen.contains(needle) {
                    match output.recv().await {
                        Some(chunk) => seen.push_str(&chunk),
                        None => break,
                    }
                }
            })
            .await
            .expect("timed out waiting for output");
            seen
        }

        #[tokio::test]
        async fn echo_reaches_observer() {
            let registry = registry_with(sh(ChannelKind::Pty), RegistryOptions::default());
            let id = registry.create_session(None).await.unwrap();
            let session = registry.get_session(&id).await.unwrap();

            let mut attachment = session.attach();
            assert!(attachment.history.is_empty());
            session.write_input("echo hi\n");
            let seen = output_until(&mut attachment.output, "hi").await;
            assert!(seen.contains("hi"), "got {seen:?}");

            registry.kill_session(&id).await;
        }

        #[tokio::test]
        async fn pty_resize_reaches_the_shell() {
            let registry = registry_with(sh(ChannelKind::Pty), RegistryOptions::default());
            let id = registry.create_session(None).await.unwrap();
            let session = registry.get_session(&id).await.unwrap();
            let mut attachment = session.attach();

            session.resize(120, 40);
            session.write_input("stty size\n");
            let seen = output_until(&mut attachment.output, "40 120").await;
            assert!(seen.contains("40 120"), "got {seen:?}");
            assert_eq!(session.geometry(), (120, 40));

            registry.kill_session(&id).await;
        }

        #[tokio::test]
        async fn pty_exit_ends_stream_with_notice() {
            let registry = registry_with(sh(ChannelKind::Pty), RegistryOptions::default());
            let id = registry.create_session(None).await.unwrap();
            let session = registry.get_session(&id).await.unwrap();
            let mut attachment = session.attach();

            session.write_input("exit\n");
            let mut last = None;
            tokio::time::timeout(Duration::from_secs(10), async {
                while let Some(chunk) = attachment.output.recv().await {
                    last = Some(chunk);
                }
            })
            .await
            .expect("stream did not end");
            assert_eq!(last.as_deref(), Some(TERMINATED_NOTICE));
            assert!(session.is_closed());
            // Natural exit leaves the session listed until it is killed or swept.
            assert_eq!(registry.count().await, 1);
        }

        #[tokio::test]
        async fn kill_does_not_wait_for_pending_input() {
            let registry = registry_with(sh(ChannelKind::Pty), RegistryOptions::default());
            let id = registry.create_session(None).await.unwrap();
            let session = registry.get_session(&id).await.unwrap();
            let mut attachment = session.attach();

            // Quoted so the echoed command line does not match.
            session.write_input("stty raw -echo; echo re''ady; sleep 30\n");
            output_until(&mut attachment.output, "ready").await;

            // Far more than the terminal buffers while nobody reads it.
            let flood = "x".repeat(256 * 1024);
            let writer = {
                let session = session.clone();
                tokio::spawn(async move { session.write_input(&flood) })
            };
            tokio::time::timeout(Duration::from_secs(5), writer)
                .await
                .expect("write_input blocked")
                .unwrap();

            let killed =
                tokio::time::timeout(Duration::from_secs(5), registry.kill_session(&id)).await;
            assert_eq!(killed.ok(), Some(true));
            assert!(session.is_closed());
            assert!(registry.list_sessions().await.is_empty());
        }

        #[tokio::test]
        async fn kill_while_attached_ends_stream_with_notice() {
            let registry = registry_with(sh(ChannelKind::Pipe), RegistryOptions::default());
            let id = registry.create_session(None).await.unwrap();
            let session = registry.get_session(&id).await.unwrap();
            let mut attachment = session.attach();

            assert!(registry.kill_session(&id).await);

            let mut chunks = Vec::new();
            while let Some(chunk) = attachment.output.recv().await {
                chunks.push(chunk);
            }
            assert_eq!(chunks.last().map(String::as_str), Some(TERMINATED_NOTICE));
            assert!(registry.list_sessions().await.iter().all(|s| s.id != id));
        }

        #[tokio::test]
        async fn sessions_are_isolated() {
            let registry = registry_with(sh(ChannelKind::Pipe), RegistryOptions::default());
            let s1 = registry.create_session(None).await.unwrap();
            let s2 = registry.create_session(None).await.unwrap();
            let one = registry.get_session(&s1).await.unwrap();
            let two = registry.get_session(&s2).await.unwrap();

            let mut attachment = one.attach();
            assert!(attachment.history.is_empty());
            one.write_input("echo only-in-one\n");
            output_until(&mut attachment.output, "only-in-one").await;

            assert!(two.history().iter().all(|c| !c.contains("only-in-one")));
            registry.close_all().await;
        }

        #[tokio::test]
        async fn pipe_session_keeps_requested_geometry() {
            let registry = registry_with(sh(ChannelKind::Pipe), RegistryOptions::default());
            let id = registry.create_session(None).await.unwrap();
            let session = registry.get_session(&id).await.unwrap();
            assert_eq!(session.geometry(), (80, 24));
            session.resize(120, 40);
            assert_eq!(session.geometry(), (120, 40));
            registry.kill_session(&id).await;
        }

        #[tokio::test]
        async fn capacity_counts_live_sessions_only() {
            let options = RegistryOptions {
                max_sessions: 1,
                ..RegistryOptions::default()
            };
            let registry = registry_with(sh(ChannelKind::Pipe), options);
            let first = registry.create_session(None).await.unwrap();
            let err = registry.create_session(None).await.unwrap_err();
            assert!(matches!(err, TermhubError::CapacityReached(_)));

            registry.get_session(&first).await.unwrap().close();
            let second = registry.create_session(None).await.unwrap();
            assert_ne!(first, second);
            registry.close_all().await;
            assert_eq!(registry.count().await, 0);
        }

        #[tokio::test]
        async fn concurrent_creates_respect_capacity() {
            let options = RegistryOptions {
                max_sessions: 1,
                ..RegistryOptions::default()
            };
            let registry = registry_with(sh(ChannelKind::Pipe), options);

            let (a, b) = tokio::join!(registry.create_session(None), registry.create_session(None));
            assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
            assert_eq!(registry.count().await, 1);
            registry.close_all().await;
        }
    }
}
