//! Sessions: pseudo channels, shell spawning, terminal sessions, registry.

pub mod channel;
pub mod history;
pub mod pipe;
pub mod pty;
pub mod registry;
pub mod spawner;
pub mod terminal;
pub mod workdir;

pub use channel::{ChannelKind, ChannelReader, PseudoChannel};
pub use registry::{EventSubscription, RegistryOptions, SessionRegistry};
pub use spawner::{ShellSpawner, SpawnFailure};
pub use terminal::{Attachment, SessionParams, TerminalSession, TERMINATED_NOTICE};
pub use workdir::{PathPolicy, RootJail};
