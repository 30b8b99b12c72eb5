//! # sqlite-session-bridge
//!
//! A serialized transactional command bridge over the session-scoped
//! connection manager in [`sqlite_session_mgr`]. An external asynchronous
//! caller (for example an embedded web content view) submits INITIALIZE,
//! STMT, COMMIT, and ROLLBACK commands; a bounded FIFO queue and a single
//! worker task execute them in arrival order and deliver structured JSON
//! results through a [`ResultSink`].
//!
//! ## Core Types
//!
//! - **[`SqliteBridge`]**: Submission API and worker lifecycle
//! - **[`BridgeMessage`]** / **[`MessageKind`]**: Structured result messages,
//!   tagged with `(generation, instance, action_index)` for correlation
//! - **[`ResultSink`]**: Where results are delivered; [`ChannelSink`] is a
//!   channel-backed implementation
//! - **[`BridgeConfig`]**: Queue capacity
//!
//! ## Generations
//!
//! Each epoch of the embedding caller (e.g. one page load) asserts an opaque
//! generation token. The first command carrying a new generation tears down
//! every session left over from other generations, so stale transactions
//! never leak across reloads.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::Value;
//! use sqlite_session_bridge::{BridgeConfig, ChannelSink, SqliteBridge};
//! use sqlite_session_mgr::{ConnectionFactory, DirStorage, SessionManagerConfig, SqlSchema};
//!
//! # async fn demo() -> sqlite_session_bridge::Result<()> {
//! let factory = Arc::new(ConnectionFactory::new(
//!     Arc::new(DirStorage::new("/data")),
//!     Arc::new(SqlSchema::empty()),
//!     SessionManagerConfig::default(),
//! ));
//! let (sink, mut results) = ChannelSink::new();
//! let bridge = SqliteBridge::new(factory, Arc::new(sink), BridgeConfig::default());
//!
//! bridge.initialize("survey", "gen1")?;
//! bridge.run_stmt("survey", "gen1", 0, 0, "INSERT INTO t (x) VALUES (?)", &Value::Null)?;
//! bridge.run_commit("survey", "gen1", 0)?;
//! while let Some(message) = results.recv().await {
//!     println!("{message:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod bridge;
mod command;
mod error;
mod queue;

pub use bridge::SqliteBridge;
pub use command::{BridgeMessage, ChannelSink, MessageKind, ResultSink};
pub use error::{Error, Result};
pub use queue::{BridgeConfig, DEFAULT_QUEUE_CAPACITY};

pub use sqlite_session_mgr;
