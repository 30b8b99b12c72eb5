//! Integration tests for the connection factory: caching, refcounting,
//! schema initialization, and bulk removal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlite_session_mgr::{
   ConnectionFactory, DirStorage, Error, Result, SchemaInit, SessionConnection,
   SessionHandle, SessionManagerConfig, SqlSchema,
};
use tempfile::TempDir;

struct TestRig {
   factory: Arc<ConnectionFactory>,
   _temp: TempDir,
}

fn setup(schema: Arc<dyn SchemaInit>) -> TestRig {
   let temp = TempDir::new().unwrap();
   let storage = Arc::new(DirStorage::new(temp.path()));
   let factory = Arc::new(ConnectionFactory::new(
      storage,
      schema,
      SessionManagerConfig::default(),
   ));
   TestRig {
      factory,
      _temp: temp,
   }
}

fn setup_default() -> TestRig {
   setup(Arc::new(SqlSchema::new(
      1,
      ["CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT)"],
   )))
}

/// Schema that counts hook invocations and records upgrade arguments.
struct CountingSchema {
   version: i64,
   creates: AtomicUsize,
   upgrades: AtomicUsize,
   upgrade_args: std::sync::Mutex<Option<(i64, i64)>>,
}

impl CountingSchema {
   fn new(version: i64) -> Self {
      Self {
         version,
         creates: AtomicUsize::new(0),
         upgrades: AtomicUsize::new(0),
         upgrade_args: std::sync::Mutex::new(None),
      }
   }
}

impl SchemaInit for CountingSchema {
   fn target_version(&self) -> i64 {
      self.version
   }

   fn on_create<'a>(&'a self, conn: &'a SessionConnection) -> BoxFuture<'a, Result<()>> {
      async move {
         self.creates.fetch_add(1, Ordering::SeqCst);
         conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await?;
         Ok(())
      }
      .boxed()
   }

   fn on_upgrade<'a>(
      &'a self,
      _conn: &'a SessionConnection,
      old_version: i64,
      new_version: i64,
   ) -> BoxFuture<'a, Result<()>> {
      async move {
         self.upgrades.fetch_add(1, Ordering::SeqCst);
         *self.upgrade_args.lock().unwrap() = Some((old_version, new_version));
         Ok(())
      }
      .boxed()
   }
}

// ============================================================================
// Caching and reference counting
// ============================================================================

#[tokio::test]
async fn test_same_qualifier_shares_one_connection() {
   let rig = setup_default();
   let session = SessionHandle::new("s1").unwrap();

   let a = rig.factory.get_connection("survey", &session).await.unwrap();
   let b = rig.factory.get_connection("survey", &session).await.unwrap();

   assert!(Arc::ptr_eq(&a, &b));
   assert_eq!(a.reference_count(), 2);

   rig.factory.release_reference(b).await;
   assert_eq!(a.reference_count(), 1);
   assert!(a.is_open());
}

#[tokio::test]
async fn test_distinct_qualifiers_get_distinct_connections() {
   let rig = setup_default();
   let s1 = SessionHandle::new("s1").unwrap();
   let s2 = SessionHandle::new("s2").unwrap();

   let a = rig.factory.get_connection("survey", &s1).await.unwrap();
   let b = rig.factory.get_connection("survey", &s2).await.unwrap();

   assert!(!Arc::ptr_eq(&a, &b));
   assert_eq!(a.reference_count(), 1);
   assert_eq!(b.reference_count(), 1);
}

#[tokio::test]
async fn test_namespace_qualifier_is_reserved() {
   let rig = setup_default();
   let session = SessionHandle::new("survey").unwrap();

   let err = rig
      .factory
      .get_connection("survey", &session)
      .await
      .unwrap_err();
   assert!(matches!(err, Error::InvalidQualifier(_)));
}

#[tokio::test]
async fn test_removed_connection_stays_usable_until_last_release() {
   let rig = setup_default();
   let session = SessionHandle::new("s1").unwrap();
   let conn = rig.factory.get_connection("survey", &session).await.unwrap();

   assert!(rig.factory.remove_connection("survey", &session).await);
   assert!(conn.is_open());
   conn.execute("INSERT INTO notes (body) VALUES (?)", &[Some("hi".into())])
      .await
      .unwrap();

   // Re-acquiring the same qualifier opens a fresh connection; the removed
   // one keeps serving its holder independently.
   let fresh = rig.factory.get_connection("survey", &session).await.unwrap();
   assert!(!Arc::ptr_eq(&conn, &fresh));
   fresh
      .execute("INSERT INTO notes (body) VALUES ('again')", &[])
      .await
      .unwrap();
   conn.execute("SELECT 1", &[]).await.unwrap();

   rig.factory.release_reference(Arc::clone(&conn)).await;
   assert!(!conn.is_open());
   assert!(matches!(
      conn.execute("SELECT 1", &[]).await,
      Err(Error::ConnectionClosed { .. })
   ));
}

#[tokio::test]
async fn test_remove_connection_reports_absence() {
   let rig = setup_default();
   let session = SessionHandle::new("never-opened").unwrap();
   assert!(!rig.factory.remove_connection("survey", &session).await);
}

// ============================================================================
// Schema initialization
// ============================================================================

#[tokio::test]
async fn test_schema_create_runs_once_per_namespace() {
   let schema = Arc::new(CountingSchema::new(3));
   let rig = setup(schema.clone());
   let s1 = SessionHandle::new("s1").unwrap();
   let s2 = SessionHandle::new("s2").unwrap();

   let conn = rig.factory.get_connection("survey", &s1).await.unwrap();
   rig.factory.get_connection("survey", &s2).await.unwrap();
   rig.factory.get_connection("tables", &s1).await.unwrap();

   assert_eq!(schema.creates.load(Ordering::SeqCst), 2);
   assert_eq!(schema.upgrades.load(Ordering::SeqCst), 0);
   assert_eq!(conn.schema_version().await.unwrap(), 3);
}

#[tokio::test]
async fn test_schema_upgrade_gets_old_and_new_versions() {
   let temp = TempDir::new().unwrap();
   let storage = Arc::new(DirStorage::new(temp.path()));
   let session = SessionHandle::new("s1").unwrap();

   let v1 = Arc::new(ConnectionFactory::new(
      storage.clone(),
      Arc::new(CountingSchema::new(1)),
      SessionManagerConfig::default(),
   ));
   v1.get_connection("survey", &session).await.unwrap();
   v1.remove_all_connections("survey").await;

   let schema = Arc::new(CountingSchema::new(4));
   let v4 = Arc::new(ConnectionFactory::new(
      storage,
      schema.clone(),
      SessionManagerConfig::default(),
   ));
   let conn = v4.get_connection("survey", &session).await.unwrap();

   assert_eq!(schema.creates.load(Ordering::SeqCst), 0);
   assert_eq!(schema.upgrades.load(Ordering::SeqCst), 1);
   assert_eq!(*schema.upgrade_args.lock().unwrap(), Some((1, 4)));
   assert_eq!(conn.schema_version().await.unwrap(), 4);
}

/// Fails its first create, succeeds afterwards.
struct FlakySchema {
   failed_once: AtomicBool,
}

impl SchemaInit for FlakySchema {
   fn target_version(&self) -> i64 {
      1
   }

   fn on_create<'a>(&'a self, conn: &'a SessionConnection) -> BoxFuture<'a, Result<()>> {
      async move {
         conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await?;
         if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidQualifier("simulated failure".into()));
         }
         Ok(())
      }
      .boxed()
   }

   fn on_upgrade<'a>(
      &'a self,
      _conn: &'a SessionConnection,
      _old_version: i64,
      _new_version: i64,
   ) -> BoxFuture<'a, Result<()>> {
      async move { Ok(()) }.boxed()
   }
}

#[tokio::test]
async fn test_failed_initialization_is_retried_from_scratch() {
   let rig = setup(Arc::new(FlakySchema {
      failed_once: AtomicBool::new(false),
   }));
   let session = SessionHandle::new("s1").unwrap();

   assert!(rig.factory.get_connection("survey", &session).await.is_err());

   // The failed attempt rolled back, so create runs again and succeeds.
   let conn = rig.factory.get_connection("survey", &session).await.unwrap();
   assert_eq!(conn.schema_version().await.unwrap(), 1);
   let rows = conn
      .fetch_all("SELECT count(*) AS n FROM t", &[])
      .await
      .unwrap();
   assert_eq!(rows[0]["n"], JsonValue::from(0));
}

/// Calls back into the factory for its own namespace from inside the hook.
struct RecursiveSchema {
   factory: std::sync::OnceLock<Arc<ConnectionFactory>>,
}

impl SchemaInit for RecursiveSchema {
   fn target_version(&self) -> i64 {
      1
   }

   fn on_create<'a>(&'a self, conn: &'a SessionConnection) -> BoxFuture<'a, Result<()>> {
      async move {
         let factory = self.factory.get().cloned().unwrap();
         let session = SessionHandle::new("nested").unwrap();
         factory
            .get_connection(conn.namespace(), &session)
            .await
            .map(|_| ())
      }
      .boxed()
   }

   fn on_upgrade<'a>(
      &'a self,
      _conn: &'a SessionConnection,
      _old_version: i64,
      _new_version: i64,
   ) -> BoxFuture<'a, Result<()>> {
      async move { Ok(()) }.boxed()
   }
}

#[tokio::test]
async fn test_reentrant_initialization_is_rejected() {
   let schema = Arc::new(RecursiveSchema {
      factory: std::sync::OnceLock::new(),
   });
   let rig = setup(schema.clone());
   schema.factory.set(Arc::clone(&rig.factory)).ok().unwrap();

   let session = SessionHandle::new("s1").unwrap();
   let err = rig
      .factory
      .get_connection("survey", &session)
      .await
      .unwrap_err();
   assert!(matches!(err, Error::ReentrantInitialization(ns) if ns == "survey"));
}

// ============================================================================
// Bulk removal
// ============================================================================

#[tokio::test]
async fn test_group_removal_matching_and_non_matching() {
   let rig = setup_default();
   let ns = "survey";
   let g1a = rig
      .factory
      .get_group_instance_connection(ns, "gen1", 0)
      .await
      .unwrap();
   rig.factory
      .get_group_instance_connection(ns, "gen1", 1)
      .await
      .unwrap();
   rig.factory
      .get_group_instance_connection(ns, "gen2", 0)
      .await
      .unwrap();
   let bare = SessionHandle::new("bare").unwrap();
   rig.factory.get_connection(ns, &bare).await.unwrap();

   // Every group except gen1 goes away.
   assert!(
      rig.factory
         .remove_group_connections(ns, Some("gen1"), true)
         .await
   );
   assert!(rig.factory.group_has_sessions(ns, "gen1"));
   assert!(!rig.factory.group_has_sessions(ns, "gen2"));

   // Now gen1 itself.
   assert!(
      rig.factory
         .remove_group_connections(ns, Some("gen1"), false)
         .await
   );
   assert!(!rig.factory.group_has_sessions(ns, "gen1"));
   rig.factory.release_reference(g1a).await;

   // The bare session was never touched.
   let qualifiers = rig.factory.session_qualifiers(ns);
   assert!(qualifiers.contains(&"bare".to_string()));
   assert!(
      !rig.factory
         .remove_group_connections(ns, Some("gen1"), false)
         .await
   );
}

#[tokio::test]
async fn test_remove_all_group_connections() {
   let rig = setup_default();
   let ns = "survey";
   rig.factory
      .get_group_instance_connection(ns, "gen1", 0)
      .await
      .unwrap();
   rig.factory
      .get_group_instance_connection(ns, "gen2", 0)
      .await
      .unwrap();

   assert!(rig.factory.remove_group_connections(ns, None, false).await);
   assert!(!rig.factory.group_has_sessions(ns, "gen1"));
   assert!(!rig.factory.group_has_sessions(ns, "gen2"));
}

#[tokio::test]
async fn test_remove_service_connections_spares_internal_and_groups() {
   let rig = setup_default();
   let ns = "survey";
   let service = SessionHandle::service();
   let internal = SessionHandle::internal();
   rig.factory.get_connection(ns, &service).await.unwrap();
   rig.factory.get_connection(ns, &internal).await.unwrap();
   rig.factory
      .get_group_instance_connection(ns, "gen1", 0)
      .await
      .unwrap();

   assert!(rig.factory.remove_service_connections(ns).await);

   let qualifiers = rig.factory.session_qualifiers(ns);
   assert!(!qualifiers.contains(&service.as_str().to_string()));
   assert!(qualifiers.contains(&internal.as_str().to_string()));
   assert!(rig.factory.group_has_sessions(ns, "gen1"));
   // The primary stays cached too.
   assert!(qualifiers.contains(&ns.to_string()));
}

#[tokio::test]
async fn test_remove_all_connections_resets_initialization() {
   let schema = Arc::new(CountingSchema::new(1));
   let rig = setup(schema.clone());
   let session = SessionHandle::new("s1").unwrap();

   let conn = rig.factory.get_connection("survey", &session).await.unwrap();
   assert!(rig.factory.remove_all_connections("survey").await);
   assert!(!conn.is_open());

   // Next access re-runs initialization (an upgrade, since the file
   // survives with its stored version).
   rig.factory.get_connection("survey", &session).await.unwrap();
   assert_eq!(schema.creates.load(Ordering::SeqCst), 1);
   assert_eq!(schema.upgrades.load(Ordering::SeqCst), 0);
   assert!(rig.factory.session_qualifiers("survey").len() >= 1);
}

#[tokio::test]
async fn test_process_wide_reset_covers_every_namespace() {
   let rig = setup_default();
   let session = SessionHandle::new("s1").unwrap();
   let survey = rig.factory.get_connection("survey", &session).await.unwrap();
   let tables = rig.factory.get_connection("tables", &session).await.unwrap();

   assert!(rig.factory.remove_all().await);
   assert!(!survey.is_open());
   assert!(!tables.is_open());
   assert!(rig.factory.session_qualifiers("survey").is_empty());
   assert!(rig.factory.session_qualifiers("tables").is_empty());
}

#[tokio::test]
async fn test_storage_unavailable_purges_namespace() {
   let temp = TempDir::new().unwrap();
   let base = temp.path().join("media");
   std::fs::create_dir(&base).unwrap();
   let factory = ConnectionFactory::new(
      Arc::new(DirStorage::new(&base)),
      Arc::new(SqlSchema::empty()),
      SessionManagerConfig::default(),
   );
   let session = SessionHandle::new("s1").unwrap();

   factory.get_connection("survey", &session).await.unwrap();
   factory.remove_all_connections("survey").await;

   std::fs::remove_dir_all(&base).unwrap();
   let err = factory
      .get_connection("survey", &session)
      .await
      .unwrap_err();
   assert!(matches!(err, Error::StorageUnavailable { .. }));
}

#[tokio::test]
async fn test_storage_loss_after_initialization_purges_cached_connections() {
   let temp = TempDir::new().unwrap();
   let base = temp.path().join("media");
   std::fs::create_dir(&base).unwrap();
   let factory = ConnectionFactory::new(
      Arc::new(DirStorage::new(&base)),
      Arc::new(SqlSchema::empty()),
      SessionManagerConfig::default(),
   );
   let held = factory
      .get_connection("survey", &SessionHandle::new("held").unwrap())
      .await
      .unwrap();

   // The namespace is fully initialized when the medium disappears.
   std::fs::remove_dir_all(&base).unwrap();
   let err = factory
      .get_connection("survey", &SessionHandle::new("late").unwrap())
      .await
      .unwrap_err();
   assert!(matches!(err, Error::StorageUnavailable { .. }));

   // Nothing cached survives the purge, the held connection included.
   assert!(!held.is_open());
   assert!(matches!(
      held.execute("SELECT 1", &[]).await,
      Err(Error::ConnectionClosed { .. })
   ));
   assert!(factory.session_qualifiers("survey").is_empty());
}

// ============================================================================
// Row decoding
// ============================================================================

#[tokio::test]
async fn test_fetch_rows_decode_to_json_in_column_order() {
   let rig = setup(Arc::new(SqlSchema::new(
      1,
      ["CREATE TABLE vals (i INTEGER, r REAL, t TEXT, b BLOB, n TEXT)"],
   )));
   let session = SessionHandle::new("s1").unwrap();
   let conn = rig.factory.get_connection("survey", &session).await.unwrap();

   conn.execute(
      "INSERT INTO vals (i, r, t, b, n) VALUES (42, 1.5, ?, x'0001ff', NULL)",
      &[Some("hello".to_string())],
   )
   .await
   .unwrap();

   let rows = conn.fetch_all("SELECT * FROM vals", &[]).await.unwrap();
   assert_eq!(rows.len(), 1);
   let row = &rows[0];

   let keys: Vec<&String> = row.keys().collect();
   assert_eq!(keys, ["i", "r", "t", "b", "n"]);
   assert_eq!(row["i"], JsonValue::from(42));
   assert_eq!(row["r"], JsonValue::from(1.5));
   assert_eq!(row["t"], JsonValue::from("hello"));
   assert_eq!(row["b"], JsonValue::from("AAH/"));
   assert_eq!(row["n"], JsonValue::Null);
}

// ============================================================================
// Transactions and diagnostics
// ============================================================================

#[tokio::test]
async fn test_uncommitted_writes_invisible_to_other_sessions() {
   let rig = setup_default();
   let writer = rig
      .factory
      .get_connection("survey", &SessionHandle::new("writer").unwrap())
      .await
      .unwrap();
   let reader = rig
      .factory
      .get_connection("survey", &SessionHandle::new("reader").unwrap())
      .await
      .unwrap();

   writer.begin().await.unwrap();
   writer
      .execute("INSERT INTO notes (body) VALUES ('draft')", &[])
      .await
      .unwrap();
   assert!(writer.in_transaction());

   let rows = reader
      .fetch_all("SELECT count(*) AS n FROM notes", &[])
      .await
      .unwrap();
   assert_eq!(rows[0]["n"], JsonValue::from(0));

   writer.commit().await.unwrap();
   assert!(!writer.in_transaction());

   let rows = reader
      .fetch_all("SELECT count(*) AS n FROM notes", &[])
      .await
      .unwrap();
   assert_eq!(rows[0]["n"], JsonValue::from(1));
}

#[tokio::test]
async fn test_rollback_discards_writes() {
   let rig = setup_default();
   let conn = rig
      .factory
      .get_connection("survey", &SessionHandle::new("s1").unwrap())
      .await
      .unwrap();

   conn.begin().await.unwrap();
   conn.execute("INSERT INTO notes (body) VALUES ('oops')", &[])
      .await
      .unwrap();
   conn.rollback().await.unwrap();

   let rows = conn
      .fetch_all("SELECT count(*) AS n FROM notes", &[])
      .await
      .unwrap();
   assert_eq!(rows[0]["n"], JsonValue::from(0));
}

#[tokio::test]
async fn test_diagnostics_dump_lists_sessions() {
   let rig = setup_default();
   let session = SessionHandle::new("s1").unwrap();
   rig.factory.get_connection("survey", &session).await.unwrap();

   let dump = rig.factory.dump_diagnostics();
   assert!(dump.contains("namespace survey"));
   assert!(dump.contains("s1"));
   assert!(dump.contains("refs=1"));
}
