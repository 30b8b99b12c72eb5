//! One open SQLite handle for one (namespace, session qualifier) pair.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::Connection as _;
use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, error, warn};

use crate::handle::SessionHandle;
use crate::{Error, Result, decode};

/// Cap on the diagnostic last-action label.
const LAST_ACTION_MAX_LEN: usize = 96;

#[derive(Debug, Default)]
struct Meta {
   reference_count: usize,
   removed: bool,
   closed: bool,
   in_transaction: bool,
   last_action: String,
}

/// What a reference release means for the connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
   /// Other holders (or the registry) still keep it alive.
   Retained,
   /// Removed from the registry and this was the last reference.
   Close,
   /// Release without a matching acquire; the count saturates at zero.
   Underflow,
}

/// A refcounted session connection.
///
/// All SQL runs through the inner async mutex, so concurrent holders of the
/// same session serialize their statements. The metadata mutex is never held
/// across an await point.
pub struct SessionConnection {
   namespace: String,
   session: SessionHandle,
   inner: tokio::sync::Mutex<Option<SqliteConnection>>,
   meta: parking_lot::Mutex<Meta>,
}

impl SessionConnection {
   pub(crate) fn new(namespace: &str, session: SessionHandle, conn: SqliteConnection) -> Self {
      Self {
         namespace: namespace.to_string(),
         session,
         inner: tokio::sync::Mutex::new(Some(conn)),
         meta: parking_lot::Mutex::new(Meta::default()),
      }
   }

   pub fn namespace(&self) -> &str {
      &self.namespace
   }

   pub fn session(&self) -> &SessionHandle {
      &self.session
   }

   /// Count of outstanding holders; gates physical close.
   pub fn reference_count(&self) -> usize {
      self.meta.lock().reference_count
   }

   pub fn is_open(&self) -> bool {
      !self.meta.lock().closed
   }

   pub fn in_transaction(&self) -> bool {
      self.meta.lock().in_transaction
   }

   /// Diagnostic label of the most recent operation.
   pub fn last_action(&self) -> String {
      self.meta.lock().last_action.clone()
   }

   pub(crate) fn acquire(&self) {
      self.meta.lock().reference_count += 1;
   }

   pub(crate) fn release(&self) -> ReleaseOutcome {
      let mut meta = self.meta.lock();
      if meta.reference_count == 0 {
         error!(
            namespace = %self.namespace,
            session = %self.session,
            "releaseReference without matching acquire"
         );
         return ReleaseOutcome::Underflow;
      }
      meta.reference_count -= 1;
      if meta.removed && meta.reference_count == 0 {
         ReleaseOutcome::Close
      } else {
         ReleaseOutcome::Retained
      }
   }

   /// Mark the connection as popped from the registry. Returns true when it
   /// can be closed immediately (no outstanding references).
   pub(crate) fn mark_removed(&self) -> bool {
      let mut meta = self.meta.lock();
      meta.removed = true;
      meta.reference_count == 0
   }

   fn note_action(&self, sql: &str) {
      let mut label: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
      if label.len() > LAST_ACTION_MAX_LEN {
         let mut end = LAST_ACTION_MAX_LEN;
         while !label.is_char_boundary(end) {
            end -= 1;
         }
         label.truncate(end);
      }
      self.meta.lock().last_action = label;
   }

   fn closed_error(&self) -> Error {
      Error::ConnectionClosed {
         namespace: self.namespace.clone(),
         session: self.session.as_str().to_string(),
      }
   }

   /// Execute a statement, returning the number of rows affected.
   pub async fn execute(&self, sql: &str, binds: &[Option<String>]) -> Result<u64> {
      self.note_action(sql);
      let mut guard = self.inner.lock().await;
      let conn = guard.as_mut().ok_or_else(|| self.closed_error())?;
      let mut query = sqlx::query(sql);
      for bind in binds {
         query = query.bind(bind.clone());
      }
      let done = query.execute(&mut *conn).await?;
      Ok(done.rows_affected())
   }

   /// Run a query and decode every row to a column-name → JSON mapping,
   /// preserving column order.
   pub async fn fetch_all(
      &self,
      sql: &str,
      binds: &[Option<String>],
   ) -> Result<Vec<IndexMap<String, JsonValue>>> {
      self.note_action(sql);
      let mut guard = self.inner.lock().await;
      let conn = guard.as_mut().ok_or_else(|| self.closed_error())?;
      let mut query = sqlx::query(sql);
      for bind in binds {
         query = query.bind(bind.clone());
      }
      let rows = query.fetch_all(&mut *conn).await?;

      let mut values = Vec::with_capacity(rows.len());
      for row in &rows {
         values.push(decode::row_to_json(row)?);
      }
      Ok(values)
   }

   /// Begin a deferred (non-exclusive) transaction. No-op when one is
   /// already open on this session.
   pub async fn begin(&self) -> Result<()> {
      if self.in_transaction() {
         return Ok(());
      }
      self.execute("BEGIN", &[]).await?;
      self.meta.lock().in_transaction = true;
      Ok(())
   }

   /// Begin an exclusive transaction, as used by schema initialization.
   pub async fn begin_exclusive(&self) -> Result<()> {
      if self.in_transaction() {
         return Ok(());
      }
      self.execute("BEGIN EXCLUSIVE", &[]).await?;
      self.meta.lock().in_transaction = true;
      Ok(())
   }

   pub async fn commit(&self) -> Result<()> {
      self.execute("COMMIT", &[]).await?;
      self.meta.lock().in_transaction = false;
      Ok(())
   }

   pub async fn rollback(&self) -> Result<()> {
      let result = self.execute("ROLLBACK", &[]).await;
      // Whatever ROLLBACK itself did, the transaction is over.
      self.meta.lock().in_transaction = false;
      result.map(|_| ())
   }

   /// Stored schema version (PRAGMA user_version).
   pub async fn schema_version(&self) -> Result<i64> {
      self.note_action("PRAGMA user_version");
      let mut guard = self.inner.lock().await;
      let conn = guard.as_mut().ok_or_else(|| self.closed_error())?;
      let row = sqlx::query("PRAGMA user_version").fetch_one(&mut *conn).await?;
      Ok(row.try_get::<i64, _>(0)?)
   }

   pub async fn set_schema_version(&self, version: i64) -> Result<()> {
      // PRAGMA does not accept bind parameters.
      self.execute(&format!("PRAGMA user_version = {version}"), &[])
         .await?;
      Ok(())
   }

   /// Physically close the underlying handle. Idempotent; a still-open
   /// transaction is rolled back by SQLite on close.
   pub(crate) async fn close(&self) {
      let conn = self.inner.lock().await.take();
      {
         let mut meta = self.meta.lock();
         meta.closed = true;
         meta.in_transaction = false;
      }
      if let Some(conn) = conn {
         if let Err(e) = conn.close().await {
            warn!(
               namespace = %self.namespace,
               session = %self.session,
               error = %e,
               "error closing session connection"
            );
         } else {
            debug!(
               namespace = %self.namespace,
               session = %self.session,
               "closed session connection"
            );
         }
      }
   }

   /// One line of diagnostics: namespace, qualifier, lifecycle counters, and
   /// the last action label.
   pub(crate) fn dump_line(&self) -> String {
      let meta = self.meta.lock();
      format!(
         "{} {} refs={} open={} tx={} last=[{}]",
         self.namespace,
         self.session,
         meta.reference_count,
         !meta.closed,
         meta.in_transaction,
         meta.last_action
      )
   }
}

impl std::fmt::Debug for SessionConnection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let meta = self.meta.lock();
      f.debug_struct("SessionConnection")
         .field("namespace", &self.namespace)
         .field("session", &self.session)
         .field("reference_count", &meta.reference_count)
         .field("removed", &meta.removed)
         .field("closed", &meta.closed)
         .field("in_transaction", &meta.in_transaction)
         .finish()
   }
}
