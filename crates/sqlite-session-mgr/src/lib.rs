//! # sqlite-session-mgr
//!
//! Session-scoped SQLite connection management: every caller-visible session
//! gets its own connection to its namespace's database file, cached and
//! shared by reference counting.
//!
//! ## Core Types
//!
//! - **[`ConnectionFactory`]**: Opens, caches, and tears down connections; runs
//!   schema initialization once per namespace
//! - **[`SessionConnection`]**: One refcounted connection, serializing the SQL
//!   of its holders
//! - **[`SessionHandle`]**: Opaque qualifier naming one session within a
//!   namespace
//! - **[`Storage`]**: Pluggable directory layout and availability checks
//! - **[`SchemaInit`]**: Create/upgrade hooks run inside an exclusive
//!   transaction on first access
//!
//! ## Architecture
//!
//! - **One connection per session**: concurrent requests for the same
//!   (namespace, qualifier) pair share a single connection
//! - **Deferred close**: removal from the cache closes the file handle only
//!   once the last reference is released
//! - **Bounded busy retry**: opens back off on SQLITE_BUSY/LOCKED on a fixed
//!   schedule and fail after a bounded number of attempts

mod config;
mod connection;
mod decode;
mod error;
mod factory;
mod handle;
mod registry;
mod schema;
mod storage;

pub use config::{RetryPolicy, SessionManagerConfig};
pub use connection::SessionConnection;
pub use decode::row_to_json;
pub use error::{Error, Result};
pub use factory::ConnectionFactory;
pub use handle::{GROUP_DIVIDER, INTERNAL_SUFFIX, SessionHandle};
pub use schema::{SchemaInit, SqlSchema};
pub use storage::{DATABASE_FILE_NAME, DirStorage, Storage};
