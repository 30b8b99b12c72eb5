//! Error types for the command bridge

use thiserror::Error;

/// Errors surfaced synchronously by the bridge's submission API.
///
/// Failures *inside* command execution never take this form: the worker
/// converts them to error payloads and delivers them through the
/// [`crate::ResultSink`] like any other result.
#[derive(Error, Debug)]
pub enum Error {
   /// The command queue is at capacity. The command was not enqueued; the
   /// caller should back off and retry.
   #[error("command queue is full")]
   QueueFull,

   /// The bridge has shut down and accepts no further commands.
   #[error("bridge worker has stopped")]
   Closed,

   /// The submitted bind parameters were not a JSON array of scalars.
   #[error("invalid bind parameters: {0}")]
   InvalidBinds(String),

   /// Error from the connection manager. Standard session-manager errors are
   /// converted to this variant.
   #[error(transparent)]
   Session(#[from] sqlite_session_mgr::Error),
}

/// A type alias for Results with our Error type.
pub type Result<T> = std::result::Result<T, Error>;
