//! Error types for sqlite-session-mgr

use thiserror::Error;

/// Errors that may occur when working with the session manager.
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to
   /// this variant.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// The storage medium backing a namespace is not available. Fatal for the
   /// whole namespace: the factory purges every cached connection for it
   /// before surfacing this error.
   #[error("storage unavailable for namespace '{namespace}': {reason}")]
   StorageUnavailable { namespace: String, reason: String },

   /// Schema initialization was re-entered, e.g. by calling
   /// `get_connection` for a namespace from inside that namespace's own
   /// create/upgrade hook. Always a programming error; never retried.
   #[error("schema initialization re-entered for namespace '{0}'")]
   ReentrantInitialization(String),

   /// The database stayed locked/busy through the whole bounded retry loop
   /// while opening a connection.
   #[error("database for namespace '{namespace}' still busy after {attempts} open attempts")]
   OpenRetriesExhausted {
      namespace: String,
      attempts: u32,
      #[source]
      source: sqlx::Error,
   },

   /// The connection has been closed and cannot be used.
   #[error("connection '{namespace}/{session}' is closed")]
   ConnectionClosed { namespace: String, session: String },

   /// A session qualifier that is empty, contains the reserved group
   /// divider, or names the reserved primary session.
   #[error("invalid session qualifier: {0}")]
   InvalidQualifier(String),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// A session connection was inserted for a namespace whose schema
   /// initialization has not completed.
   #[error("namespace '{0}' has not completed schema initialization")]
   NotInitialized(String),
}

impl Error {
   /// Extract the numeric SQLite error code when this error wraps a
   /// database-level failure. Used by callers that need a machine-readable
   /// code, e.g. for structured error payloads.
   pub fn sqlite_error_code(&self) -> Option<i64> {
      match self {
         Error::Sqlx(e) | Error::OpenRetriesExhausted { source: e, .. } => e
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .and_then(|code| code.parse::<i64>().ok()),
         _ => None,
      }
   }
}

/// A type alias for Results with our Error type.
pub type Result<T> = std::result::Result<T, Error>;
