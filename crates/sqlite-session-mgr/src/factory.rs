//! The connection factory: opens, caches, and tears down session
//! connections, and runs schema initialization exactly once per namespace.

use std::sync::Arc;

use sqlx::ConnectOptions as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use tracing::{debug, info, warn};

use crate::config::SessionManagerConfig;
use crate::connection::{ReleaseOutcome, SessionConnection};
use crate::handle::{INTERNAL_SUFFIX, SessionHandle, group_of};
use crate::registry::{InitState, SessionRegistry};
use crate::schema::{self, SchemaInit};
use crate::storage::Storage;
use crate::{Error, Result};

/// SQLite primary result codes meaning the database file is transiently
/// locked: SQLITE_BUSY, SQLITE_LOCKED and their _SHAREDCACHE variants.
fn is_busy(err: &sqlx::Error) -> bool {
   err.as_database_error()
      .and_then(|db| db.code())
      .is_some_and(|code| matches!(code.as_ref(), "5" | "6" | "261" | "262"))
}

/// Factory and cache for [`SessionConnection`]s.
///
/// One factory instance serves every namespace. Each distinct
/// (namespace, session qualifier) pair maps to at most one live connection;
/// concurrent requests for the same pair share it via reference counting.
/// The first access to a namespace verifies its storage, lays out its
/// directory structure, and runs the [`SchemaInit`] hooks on a reserved
/// primary connection before any session connection is handed out.
pub struct ConnectionFactory {
   registry: SessionRegistry,
   storage: Arc<dyn Storage>,
   schema: Arc<dyn SchemaInit>,
   config: SessionManagerConfig,
}

impl ConnectionFactory {
   pub fn new(
      storage: Arc<dyn Storage>,
      schema: Arc<dyn SchemaInit>,
      config: SessionManagerConfig,
   ) -> Self {
      Self {
         registry: SessionRegistry::default(),
         storage,
         schema,
         config,
      }
   }

   /// Get or open the connection for one session, taking a reference on it.
   ///
   /// The namespace itself is a reserved qualifier (the schema-initialization
   /// primary) and is rejected here.
   pub async fn get_connection(
      &self,
      namespace: &str,
      session: &SessionHandle,
   ) -> Result<Arc<SessionConnection>> {
      if session.as_str() == namespace {
         return Err(Error::InvalidQualifier(format!(
            "qualifier '{}' is reserved for the namespace's primary connection",
            session
         )));
      }
      self.reap().await;
      self.ensure_ready(namespace).await?;

      if let Some(conn) = self.registry.get(namespace, session.as_str()) {
         return Ok(conn);
      }

      let opened = self.open_with_retry(namespace, session.clone()).await?;
      let (conn, loser) =
         self.registry
            .insert_or_existing(namespace, session.as_str(), Arc::new(opened))?;
      if let Some(loser) = loser {
         // Another task opened the same session first; ours is surplus.
         loser.close().await;
      }
      debug!(namespace, session = %session, "session connection acquired");
      Ok(conn)
   }

   /// Get or open the connection for a group-instance session,
   /// `"<group>--<instance>"`.
   pub async fn get_group_instance_connection(
      &self,
      namespace: &str,
      group: &str,
      instance: i64,
   ) -> Result<Arc<SessionConnection>> {
      let session = SessionHandle::group_instance(group, instance)?;
      self.get_connection(namespace, &session).await
   }

   /// Release one caller reference. When the connection was already removed
   /// from the registry and this was the last reference, it is physically
   /// closed here.
   pub async fn release_reference(&self, conn: Arc<SessionConnection>) {
      if conn.release() == ReleaseOutcome::Close {
         self.registry.discard_pending(&conn);
         conn.close().await;
      }
   }

   /// Remove one session from the registry. Returns true when a connection
   /// was found. The physical close is deferred until outstanding references
   /// are released.
   pub async fn remove_connection(&self, namespace: &str, session: &SessionHandle) -> bool {
      let (closable, removed) = self.registry.remove(namespace, session.as_str());
      if let Some(conn) = closable {
         conn.close().await;
      }
      removed
   }

   /// Remove group-instance sessions of one namespace.
   ///
   /// With `group = Some(g)`, removes the sessions of that group, or, when
   /// `non_matching_only` is set, the sessions of every *other* group (used
   /// when a new generation supersedes the old ones). With `group = None`,
   /// removes every group-instance session. Returns true when anything was
   /// removed.
   pub async fn remove_group_connections(
      &self,
      namespace: &str,
      group: Option<&str>,
      non_matching_only: bool,
   ) -> bool {
      let target = group.map(str::to_string);
      let (closable, removed_any) = self.registry.remove_matching(namespace, |qualifier| {
         let Some(g) = group_of(qualifier) else {
            return false;
         };
         match (&target, non_matching_only) {
            (Some(t), false) => g == t,
            (Some(t), true) => g != t,
            (None, _) => true,
         }
      });
      for conn in closable {
         conn.close().await;
      }
      removed_any
   }

   /// Remove the namespace's sessions opened on behalf of external service
   /// callers: everything except group-instance sessions, internal-use
   /// sessions, and the namespace's primary connection.
   pub async fn remove_service_connections(&self, namespace: &str) -> bool {
      let ns = namespace.to_string();
      let (closable, removed_any) = self.registry.remove_matching(namespace, |qualifier| {
         qualifier != ns
            && group_of(qualifier).is_none()
            && !qualifier.ends_with(INTERNAL_SUFFIX)
      });
      for conn in closable {
         conn.close().await;
      }
      removed_any
   }

   /// Remove service sessions across every namespace.
   pub async fn remove_all_service_connections(&self) -> bool {
      let mut removed_any = false;
      for namespace in self.registry.namespaces() {
         removed_any |= self.remove_service_connections(&namespace).await;
      }
      removed_any
   }

   /// Tear down the whole namespace: force-close every connection, including
   /// the primary and any pending ones, and reset the schema-initialization
   /// state so the next access starts from scratch. Outstanding holders see
   /// a connection-closed error on their next operation.
   pub async fn remove_all_connections(&self, namespace: &str) -> bool {
      let closable = self.registry.remove_namespace(namespace);
      let removed_any = !closable.is_empty();
      for conn in closable {
         conn.close().await;
      }
      if removed_any {
         info!(namespace, "removed all connections for namespace");
      }
      removed_any
   }

   /// Process-wide reset: tear down every namespace. Used during app-wide
   /// resets and test isolation.
   pub async fn remove_all(&self) -> bool {
      let mut removed_any = false;
      for namespace in self.registry.namespaces() {
         removed_any |= self.remove_all_connections(&namespace).await;
      }
      removed_any
   }

   /// Close removed connections whose last reference has since been
   /// released. Cheap; suitable for calling opportunistically.
   pub async fn reap(&self) {
      for conn in self.registry.take_reapable() {
         conn.close().await;
      }
   }

   /// Whether any live session belongs to the given group.
   pub fn group_has_sessions(&self, namespace: &str, group: &str) -> bool {
      self.registry.group_has_sessions(namespace, group)
   }

   /// Qualifiers of the live sessions in one namespace, primary included.
   pub fn session_qualifiers(&self, namespace: &str) -> Vec<String> {
      self.registry.qualifiers(namespace)
   }

   /// Multi-line diagnostic dump of every namespace and connection.
   pub fn dump_diagnostics(&self) -> String {
      self.registry.dump()
   }

   /// Make sure the namespace's storage is still present and its schema
   /// hooks have run. The storage check runs on every call, Ready or not: a
   /// medium that went away invalidates everything cached for the namespace.
   /// Initialization is serialized per namespace; reentrant calls from
   /// inside the hooks themselves are rejected rather than deadlocking.
   async fn ensure_ready(&self, namespace: &str) -> Result<()> {
      if let Err(e) = self.storage.verify_available(namespace) {
         // The medium went away; nothing cached for it can be trusted.
         warn!(namespace, error = %e, "storage unavailable, purging namespace");
         self.remove_all_connections(namespace).await;
         return Err(e);
      }

      if self.registry.init_state(namespace) == InitState::Ready {
         return Ok(());
      }
      if schema::is_initializing(namespace) {
         return Err(Error::ReentrantInitialization(namespace.to_string()));
      }

      let init_lock = self.registry.init_lock(namespace);
      let _guard = init_lock.lock().await;
      if self.registry.init_state(namespace) == InitState::Ready {
         return Ok(());
      }

      self.storage.assert_directory_structure(namespace)?;

      let primary = SessionHandle::raw(namespace);
      let opened = self.open_with_retry(namespace, primary).await?;
      let (primary, loser) = self
         .registry
         .insert_or_existing(namespace, namespace, Arc::new(opened))?;
      if let Some(loser) = loser {
         loser.close().await;
      }

      let outcome = schema::enter(namespace.to_string(), self.run_schema_hooks(&primary)).await;
      self.release_reference(Arc::clone(&primary)).await;

      match outcome {
         Ok(()) => {
            self.registry.set_init_state(namespace, InitState::Ready);
            info!(namespace, "namespace initialized");
            Ok(())
         }
         Err(e) => {
            warn!(namespace, error = %e, "schema initialization failed");
            let (closable, _) = self.registry.remove(namespace, namespace);
            if let Some(conn) = closable {
               conn.close().await;
            }
            Err(e)
         }
      }
   }

   async fn run_schema_hooks(&self, primary: &SessionConnection) -> Result<()> {
      primary.begin_exclusive().await?;

      let target = self.schema.target_version();
      let result = async {
         let version = primary.schema_version().await?;
         if version == 0 {
            self.schema.on_create(primary).await?;
         } else if version < target {
            self.schema.on_upgrade(primary, version, target).await?;
         } else if version > target {
            warn!(
               namespace = primary.namespace(),
               stored = version,
               target,
               "database schema is newer than this build expects"
            );
            return Ok(());
         } else {
            return Ok(());
         }
         primary.set_schema_version(target).await
      }
      .await;

      match result {
         Ok(()) => primary.commit().await,
         Err(e) => {
            if let Err(rb) = primary.rollback().await {
               warn!(error = %rb, "rollback after failed schema initialization");
            }
            Err(e)
         }
      }
   }

   /// Open a raw connection for one session, retrying on busy/locked
   /// failures per the configured schedule.
   async fn open_with_retry(
      &self,
      namespace: &str,
      session: SessionHandle,
   ) -> Result<SessionConnection> {
      let path = self.storage.database_path(namespace);
      let options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true)
         .journal_mode(SqliteJournalMode::Wal);

      let policy = &self.config.retry;
      let mut last_busy: Option<sqlx::Error> = None;
      for attempt in 1..=policy.max_attempts {
         match options.connect().await {
            Ok(conn) => {
               if attempt > 1 {
                  debug!(namespace, session = %session, attempt, "opened after retries");
               }
               return Ok(SessionConnection::new(namespace, session.clone(), conn));
            }
            Err(e) if is_busy(&e) => {
               last_busy = Some(e);
               if attempt < policy.max_attempts {
                  debug!(namespace, session = %session, attempt, "database busy, retrying");
                  tokio::time::sleep(policy.delay_for(attempt)).await;
               }
            }
            Err(e) => return Err(e.into()),
         }
      }

      Err(Error::OpenRetriesExhausted {
         namespace: namespace.to_string(),
         attempts: policy.max_attempts,
         source: last_busy.unwrap_or(sqlx::Error::PoolTimedOut),
      })
   }
}

impl std::fmt::Debug for ConnectionFactory {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionFactory")
         .field("config", &self.config)
         .finish_non_exhaustive()
   }
}
