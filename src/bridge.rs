//! The transaction bridge: a single serial worker draining the command
//! queue, executing each command against group-instance sessions from the
//! connection manager, and delivering results through the [`ResultSink`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value as JsonValue, json};
use sqlite_session_mgr::{ConnectionFactory, SessionConnection, SessionHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{BridgeMessage, Command, MessageKind, ResultSink, parse_binds};
use crate::queue::{BridgeConfig, CommandQueue};
use crate::{Error, Result};

/// One open bridge transaction: (namespace, generation, instance).
type TxKey = (String, String, i64);

/// Serialized command bridge between an external asynchronous caller and the
/// connection manager.
///
/// Commands are appended to a bounded FIFO and executed one at a time, to
/// completion, by a single worker task; this yields a total order over all
/// commands across every generation and transaction. Submission never
/// blocks: a full queue fails fast with [`Error::QueueFull`].
///
/// Dropping the bridge (or calling [`SqliteBridge::shutdown`]) stops the
/// worker after the queued commands drain; any transactions still open at
/// that point are rolled back and their sessions released, treating caller
/// disconnection as an implicit abort.
pub struct SqliteBridge {
   queue: CommandQueue,
   worker: tokio::task::JoinHandle<()>,
}

impl SqliteBridge {
   /// Start a bridge over the given factory. Must be called within a tokio
   /// runtime; the worker runs as a spawned task.
   pub fn new(
      factory: Arc<ConnectionFactory>,
      sink: Arc<dyn ResultSink>,
      config: BridgeConfig,
   ) -> Self {
      let (queue, rx) = CommandQueue::new(config.queue_capacity);
      let worker = Worker {
         factory,
         sink,
         transactions: HashMap::new(),
      };
      Self {
         queue,
         worker: tokio::spawn(worker.run(rx)),
      }
   }

   /// Assert `generation` as the namespace's current epoch. Sessions left
   /// over from other generations are torn down when the worker gets to this
   /// command, with a cleanup message delivered if anything was removed.
   pub fn initialize(&self, namespace: &str, generation: &str) -> Result<()> {
      self.queue.submit(Command::Initialize {
         namespace: namespace.to_string(),
         generation: generation.to_string(),
      })
   }

   /// Execute one SQL statement inside the (generation, instance)
   /// transaction, beginning it if this is the first statement. `binds` is a
   /// JSON array of scalars (string/number/null); the result arrives later
   /// through the sink, tagged with `(generation, instance, action_index)`.
   pub fn run_stmt(
      &self,
      namespace: &str,
      generation: &str,
      instance: i64,
      action_index: u32,
      sql: &str,
      binds: &JsonValue,
   ) -> Result<()> {
      let binds = parse_binds(binds)?;
      self.queue.submit(Command::Stmt {
         namespace: namespace.to_string(),
         generation: generation.to_string(),
         instance,
         action_index,
         sql: sql.to_string(),
         binds,
      })
   }

   /// Commit the (generation, instance) transaction and release its session.
   /// Committing a transaction that no longer exists is not an error.
   pub fn run_commit(&self, namespace: &str, generation: &str, instance: i64) -> Result<()> {
      self.queue.submit(Command::Commit {
         namespace: namespace.to_string(),
         generation: generation.to_string(),
         instance,
      })
   }

   /// Roll back the (generation, instance) transaction and release its
   /// session. Rolling back a transaction that no longer exists is not an
   /// error.
   pub fn run_rollback(&self, namespace: &str, generation: &str, instance: i64) -> Result<()> {
      self.queue.submit(Command::Rollback {
         namespace: namespace.to_string(),
         generation: generation.to_string(),
         instance,
      })
   }

   /// Stop accepting commands, drain the queue, and wait for the worker to
   /// finish aborting any transactions still open.
   pub async fn shutdown(self) {
      drop(self.queue);
      if self.worker.await.is_err() {
         warn!("bridge worker panicked during shutdown");
      }
   }
}

struct Worker {
   factory: Arc<ConnectionFactory>,
   sink: Arc<dyn ResultSink>,
   /// Sessions with an open bridge transaction; each entry holds the
   /// reference that keeps the connection alive across commands.
   transactions: HashMap<TxKey, Arc<SessionConnection>>,
}

impl Worker {
   async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
      while let Some(command) = rx.recv().await {
         self.process(command).await;
      }
      self.abort_all().await;
   }

   async fn process(&mut self, command: Command) {
      self.assert_generation(command.namespace(), command.generation())
         .await;

      match command {
         Command::Initialize { .. } => {
            // assert_generation above did all the work.
         }
         Command::Stmt {
            namespace,
            generation,
            instance,
            action_index,
            sql,
            binds,
         } => {
            let outcome = self
               .exec_stmt(&namespace, &generation, instance, &sql, &binds)
               .await;
            self.deliver(&namespace, &generation, Some(instance), Some(action_index), outcome);
         }
         Command::Commit {
            namespace,
            generation,
            instance,
         } => {
            let outcome = self.finish(&namespace, &generation, instance, true).await;
            self.deliver(&namespace, &generation, Some(instance), None, outcome);
         }
         Command::Rollback {
            namespace,
            generation,
            instance,
         } => {
            let outcome = self.finish(&namespace, &generation, instance, false).await;
            self.deliver(&namespace, &generation, Some(instance), None, outcome);
         }
      }
   }

   /// Tear down every session of the namespace belonging to a generation
   /// other than the asserted one. Stale sessions die here, on the first
   /// command of the new generation, not proactively.
   async fn assert_generation(&mut self, namespace: &str, generation: &str) {
      let removed = self
         .factory
         .remove_group_connections(namespace, Some(generation), true)
         .await;
      if !removed {
         return;
      }

      let stale: Vec<TxKey> = self
         .transactions
         .keys()
         .filter(|(ns, g, _)| ns == namespace && g != generation)
         .cloned()
         .collect();
      for key in stale {
         if let Some(conn) = self.transactions.remove(&key) {
            self.factory.release_reference(conn).await;
         }
      }

      info!(namespace, generation, "invalidated sessions from previous generations");
      self.sink.deliver(BridgeMessage {
         kind: MessageKind::Cleanup,
         namespace: namespace.to_string(),
         generation: generation.to_string(),
         instance: None,
         action_index: None,
         payload: json!({}),
      });
   }

   async fn exec_stmt(
      &mut self,
      namespace: &str,
      generation: &str,
      instance: i64,
      sql: &str,
      binds: &[Option<String>],
   ) -> Result<JsonValue> {
      let key = (namespace.to_string(), generation.to_string(), instance);
      let conn = if let Some(conn) = self.transactions.get(&key) {
         Arc::clone(conn)
      } else {
         // Lazy begin: the first statement for a group-instance opens its
         // session and starts a deferred transaction. The map entry holds
         // the reference that keeps the session alive until COMMIT/ROLLBACK.
         let conn = self
            .factory
            .get_group_instance_connection(namespace, generation, instance)
            .await?;
         if let Err(e) = conn.begin().await {
            self.factory.release_reference(conn).await;
            return Err(e.into());
         }
         self.transactions.insert(key, Arc::clone(&conn));
         conn
      };

      if is_row_returning(sql) {
         let rows = conn.fetch_all(sql, binds).await?;
         let rows: Vec<JsonValue> = rows
            .into_iter()
            .map(|row| JsonValue::Object(row.into_iter().collect()))
            .collect();
         Ok(json!({ "rowsAffected": 0, "rows": rows }))
      } else {
         conn.execute(sql, binds).await?;
         Ok(json!({}))
      }
   }

   /// Terminate the (generation, instance) transaction. A transaction that
   /// no longer exists (already invalidated by a generation change) is
   /// logged and reported as success.
   async fn finish(
      &mut self,
      namespace: &str,
      generation: &str,
      instance: i64,
      commit: bool,
   ) -> Result<JsonValue> {
      let verb = if commit { "commit" } else { "rollback" };
      let key = (namespace.to_string(), generation.to_string(), instance);

      let Some(conn) = self.transactions.remove(&key) else {
         warn!(namespace, generation, instance, "{verb} -- transaction not found");
         return Ok(json!({}));
      };
      debug!(namespace, generation, instance, "{verb}");

      let result = if commit {
         conn.commit().await
      } else {
         conn.rollback().await
      };

      // Win or lose, the session goes away.
      let session = SessionHandle::group_instance(generation, instance)?;
      self.factory.remove_connection(namespace, &session).await;
      self.factory.release_reference(conn).await;

      result?;
      Ok(json!({}))
   }

   fn deliver(
      &self,
      namespace: &str,
      generation: &str,
      instance: Option<i64>,
      action_index: Option<u32>,
      outcome: Result<JsonValue>,
   ) {
      let (kind, payload) = match outcome {
         Ok(payload) => (MessageKind::Result, payload),
         Err(e) => (
            MessageKind::Error,
            json!({ "error": e.to_string(), "errorCode": error_code(&e) }),
         ),
      };
      self.sink.deliver(BridgeMessage {
         kind,
         namespace: namespace.to_string(),
         generation: generation.to_string(),
         instance,
         action_index,
         payload,
      });
   }

   /// Roll back and release every open transaction; the disconnection case,
   /// where there is no one left to report to.
   async fn abort_all(&mut self) {
      if !self.transactions.is_empty() {
         info!(
            transactions = self.transactions.len(),
            "bridge stopping; aborting open transactions"
         );
      }
      for ((namespace, generation, instance), conn) in std::mem::take(&mut self.transactions) {
         if let Err(e) = conn.rollback().await {
            warn!(namespace, generation, instance, error = %e, "rollback on shutdown");
         }
         if let Ok(session) = SessionHandle::group_instance(&generation, instance) {
            self.factory.remove_connection(&namespace, &session).await;
         }
         self.factory.release_reference(conn).await;
      }
   }
}

/// Whether the statement produces a result set. Matches on the leading SQL
/// verb, as the embedding caller only ever reads via SELECT.
fn is_row_returning(sql: &str) -> bool {
   sql.split_whitespace()
      .next()
      .is_some_and(|verb| verb.eq_ignore_ascii_case("SELECT"))
}

fn error_code(err: &Error) -> i64 {
   match err {
      Error::Session(e) => e.sqlite_error_code().unwrap_or(0),
      _ => 0,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_row_returning_detection() {
      assert!(is_row_returning("SELECT * FROM t"));
      assert!(is_row_returning("  select x from t"));
      assert!(!is_row_returning("INSERT INTO t VALUES (1)"));
      assert!(!is_row_returning(""));
   }
}
