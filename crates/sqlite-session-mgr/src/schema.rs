//! Schema initialization hooks and the reentrancy guard around them.
//!
//! The first connection opened for a namespace runs the schema hooks inside
//! an exclusive transaction before any session connection is handed out.
//! Initialization code that calls back into the factory for the same
//! namespace would self-deadlock, so entry is tracked per task and rejected
//! with [`crate::Error::ReentrantInitialization`].

use futures::future::BoxFuture;

use crate::Result;
use crate::connection::SessionConnection;

/// Callbacks invoked while a namespace's database is being prepared.
///
/// The connection passed in already has an exclusive transaction open; hooks
/// must not commit, roll back, or close it. On success the stored schema
/// version (`PRAGMA user_version`) is advanced to
/// [`SchemaInit::target_version`] and the transaction committed; on error it
/// is rolled back and the namespace is torn down so the next access retries
/// from scratch.
pub trait SchemaInit: Send + Sync + 'static {
   /// Version the database should be at after a successful run.
   fn target_version(&self) -> i64;

   /// Called when the stored version is 0 (fresh database).
   fn on_create<'a>(&'a self, conn: &'a SessionConnection) -> BoxFuture<'a, Result<()>>;

   /// Called when the stored version is non-zero and below the target.
   fn on_upgrade<'a>(
      &'a self,
      conn: &'a SessionConnection,
      old_version: i64,
      new_version: i64,
   ) -> BoxFuture<'a, Result<()>>;
}

/// [`SchemaInit`] that runs fixed statement lists.
///
/// Upgrades re-run the create statements, which is adequate for idempotent
/// `CREATE TABLE IF NOT EXISTS` style schemas; richer migration logic should
/// implement the trait directly.
pub struct SqlSchema {
   version: i64,
   create_sql: Vec<String>,
}

impl SqlSchema {
   pub fn new(version: i64, create_sql: impl IntoIterator<Item = impl Into<String>>) -> Self {
      Self {
         version,
         create_sql: create_sql.into_iter().map(Into::into).collect(),
      }
   }

   /// A schema with no statements; useful when the application manages its
   /// own tables lazily.
   pub fn empty() -> Self {
      Self {
         version: 1,
         create_sql: Vec::new(),
      }
   }

   async fn run_all(&self, conn: &SessionConnection) -> Result<()> {
      for sql in &self.create_sql {
         conn.execute(sql, &[]).await?;
      }
      Ok(())
   }
}

impl SchemaInit for SqlSchema {
   fn target_version(&self) -> i64 {
      self.version
   }

   fn on_create<'a>(&'a self, conn: &'a SessionConnection) -> BoxFuture<'a, Result<()>> {
      use futures::FutureExt as _;
      self.run_all(conn).boxed()
   }

   fn on_upgrade<'a>(
      &'a self,
      conn: &'a SessionConnection,
      _old_version: i64,
      _new_version: i64,
   ) -> BoxFuture<'a, Result<()>> {
      use futures::FutureExt as _;
      self.run_all(conn).boxed()
   }
}

tokio::task_local! {
   /// Namespace currently being initialized by this task, if any.
   static INITIALIZING_NAMESPACE: String;
}

/// True when the current task is inside schema initialization for the given
/// namespace.
pub(crate) fn is_initializing(namespace: &str) -> bool {
   INITIALIZING_NAMESPACE
      .try_with(|ns| ns == namespace)
      .unwrap_or(false)
}

/// Run `fut` with the task marked as initializing `namespace`.
pub(crate) async fn enter<F, T>(namespace: String, fut: F) -> T
where
   F: std::future::Future<Output = T>,
{
   INITIALIZING_NAMESPACE.scope(namespace, fut).await
}
