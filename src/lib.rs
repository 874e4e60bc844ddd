//! # DX Coedit - Real-time Collaborative Editing Core
//!
//! Keeps every participant's copy of a shared text buffer convergent while
//! edits are applied optimistically, and shows who is where in the document.
//!
//! ## Features
//!
//! - **Convergent replicas**: operations integrate in any delivery order and
//!   every replica ends up with the same text
//! - **Optimistic local edits**: applied immediately, sent in the background
//! - **Resync**: missed operations are replayed, or a snapshot is installed
//! - **Live presence**: remote cursors and pointers with automatic expiry
//! - **WebSocket relay**: `coedit serve` routes sessions between editors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dx_coedit::{CollabConfig, CollabSession, MemoryHub};
//! use dx_coedit::encoder::{RangeChange, TextChange};
//!
//! let hub = MemoryHub::default();
//! let (gateway, _inbound) = hub.connect();
//! let mut session = CollabSession::new(gateway, CollabConfig::default());
//!
//! session.local_change(TextChange::Ranges(vec![RangeChange::insert(0, "fn main() {}")]))?;
//! assert_eq!(session.snapshot(), ("fn main() {}".to_string(), 1));
//! # Ok::<(), dx_coedit::CollabError>(())
//! ```

pub mod config;
pub mod crdt;
pub mod document;
pub mod encoder;
pub mod error;
pub mod presence;
pub mod sequencer;
pub mod server;
pub mod sync;
pub mod telemetry;

// Re-export main types for library consumers
pub use config::CollabConfig;
pub use crdt::{Operation, OperationKind, SiteId, VersionVector};
pub use document::{DocumentReplica, Edit};
pub use error::{CollabError, ErrorCategory, RetryPolicy};
pub use presence::{PresenceChange, PresenceTracker, PresenceValue};
pub use sequencer::{DocumentSnapshot, OperationSequencer};
pub use sync::{CollabSession, DocumentEvent, Gateway, MemoryHub, Message, WsGateway};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
