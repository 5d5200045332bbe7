//! Ghostline Core Library
//!
//! Serverless 1:1 chat and call signaling over a distributed key/value
//! directory. Each party periodically publishes a small encrypted
//! record under their own key and polls the peer's; messages,
//! acknowledgments, nicknames and call signals all ride in that one
//! record.
//!
//! ## Core Principles
//!
//! - **No rendezvous server**: the directory network is the only
//!   shared infrastructure
//! - **Poll-only transport**: no push channel; cadence adapts between
//!   active, idle and call-negotiation rates
//! - **At-least-once with dedup**: records are republished until acked;
//!   deterministic message ids make replays harmless
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ghostline_core::{
//!     MemoryDirectory, RedbStore, SessionParams, SessionSync, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let directory = Arc::new(MemoryDirectory::new());
//!     let store = Arc::new(RedbStore::new("~/.ghostline/sessions.redb")?);
//!
//!     let sync = SessionSync::start(
//!         directory,
//!         store,
//!         SessionParams {
//!             seed: "my-keypair-seed".into(),
//!             peer_pub_key: "peer-public-key".into(),
//!             enc_key: "shared-key".into(),
//!             created_by_me: true,
//!         },
//!         SyncConfig::default(),
//!     )
//!     .await?;
//!
//!     sync.send("hello").await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod codec;
pub mod directory;
pub mod engine;
pub mod error;
pub mod poller;
pub mod session;
pub mod signal;
pub mod storage;
pub mod types;

// Re-exports
pub use call::{
    CallAction, CallInput, CallMachine, CallSession, CallState, CallTransport, TransportEvent,
};
pub use codec::{build_sdp, compress_sdp};
pub use directory::{
    Directory, DirectoryMessage, MemoryDirectory, PublishRequest, ResolvedBatch,
};
pub use engine::{SessionParams, SessionSync, SyncConfig, SyncEvent, TechInfo};
pub use error::{ChatError, ChatResult};
pub use poller::{BackgroundPoller, PollerConfig, PollerEvent};
pub use session::Session;
pub use signal::{CallSignal, MediaKind, SignalKind, TransportParams};
pub use storage::{MemoryStore, RedbStore, SessionStore};
pub use types::{
    CallEvent, CallEventKind, ChatMessage, CompactMessage, ConnectionStatus, MessageMeta, Sender,
    SessionId, SystemEvent, JOIN_TEXT,
};
