//! Treesync - bidirectional file-tree synchronization
//!
//! Watches a local directory, batches changes after a quiet period and
//! publishes them to a remote peer, while applying the peer's pushes back
//! onto the tree without re-publishing them.

pub mod echo;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod journal;
pub mod publisher;
pub mod queue;
pub mod server;
pub mod types;
pub mod watcher;

pub use engine::{SyncEngine, SyncStatusReport};
pub use error::{Result, SyncError};
pub use journal::{SyncJournal, SyncLogEntry};
pub use publisher::{HttpPublisher, Publisher};
pub use server::SyncServer;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
