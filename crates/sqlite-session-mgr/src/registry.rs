//! In-memory registry of live session connections, keyed by namespace and
//! session qualifier.
//!
//! The registry is a plain synchronous map behind a `parking_lot` mutex; it
//! never performs I/O and the lock is never held across an await point.
//! Connections that are removed while callers still hold references move to
//! a per-namespace pending list and are handed back for physical close once
//! their reference count drains.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::connection::SessionConnection;
use crate::handle::group_of;
use crate::{Error, Result};

/// Schema-initialization progress for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum InitState {
   #[default]
   NotStarted,
   Ready,
}

#[derive(Default)]
struct NamespaceEntry {
   sessions: BTreeMap<String, Arc<SessionConnection>>,
   init: InitState,
   init_lock: Arc<tokio::sync::Mutex<()>>,
   /// Removed from `sessions` but still referenced by callers.
   pending: Vec<Arc<SessionConnection>>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
   inner: parking_lot::Mutex<BTreeMap<String, NamespaceEntry>>,
}

impl SessionRegistry {
   /// Look up an existing session connection, taking a caller reference on it.
   pub(crate) fn get(&self, namespace: &str, qualifier: &str) -> Option<Arc<SessionConnection>> {
      let inner = self.inner.lock();
      let conn = inner.get(namespace)?.sessions.get(qualifier)?;
      conn.acquire();
      Some(Arc::clone(conn))
   }

   /// Atomic set-or-get-existing: insert `candidate` unless another task won
   /// the race, in which case the winner is returned and `candidate` is
   /// handed back for close. A caller reference is taken on the returned
   /// connection either way.
   ///
   /// Only the primary qualifier (equal to the namespace) may be inserted
   /// before the namespace's schema initialization has completed.
   pub(crate) fn insert_or_existing(
      &self,
      namespace: &str,
      qualifier: &str,
      candidate: Arc<SessionConnection>,
   ) -> Result<(Arc<SessionConnection>, Option<Arc<SessionConnection>>)> {
      let mut inner = self.inner.lock();
      let entry = inner.entry(namespace.to_string()).or_default();
      if entry.init != InitState::Ready && qualifier != namespace {
         return Err(Error::NotInitialized(namespace.to_string()));
      }
      if let Some(existing) = entry.sessions.get(qualifier) {
         existing.acquire();
         return Ok((Arc::clone(existing), Some(candidate)));
      }
      candidate.acquire();
      entry
         .sessions
         .insert(qualifier.to_string(), Arc::clone(&candidate));
      Ok((candidate, None))
   }

   /// Pop one session from the registry. The bool reports whether a session
   /// was found; the connection is returned only when it can be closed
   /// immediately, otherwise it is parked on the pending list.
   pub(crate) fn remove(
      &self,
      namespace: &str,
      qualifier: &str,
   ) -> (Option<Arc<SessionConnection>>, bool) {
      let mut inner = self.inner.lock();
      let Some(entry) = inner.get_mut(namespace) else {
         return (None, false);
      };
      let Some(conn) = entry.sessions.remove(qualifier) else {
         return (None, false);
      };
      if conn.mark_removed() {
         (Some(conn), true)
      } else {
         entry.pending.push(conn);
         (None, true)
      }
   }

   /// Pop every session of `namespace` matching `predicate`. Returns the
   /// connections that are immediately closable and whether anything at all
   /// was removed.
   pub(crate) fn remove_matching(
      &self,
      namespace: &str,
      predicate: impl Fn(&str) -> bool,
   ) -> (Vec<Arc<SessionConnection>>, bool) {
      let mut inner = self.inner.lock();
      let Some(entry) = inner.get_mut(namespace) else {
         return (Vec::new(), false);
      };
      let qualifiers: Vec<String> = entry
         .sessions
         .keys()
         .filter(|q| predicate(q))
         .cloned()
         .collect();
      let removed_any = !qualifiers.is_empty();

      let mut closable = Vec::new();
      for qualifier in qualifiers {
         if let Some(conn) = entry.sessions.remove(&qualifier) {
            if conn.mark_removed() {
               closable.push(conn);
            } else {
               warn!(
                  namespace,
                  session = %qualifier,
                  "removing session connection with outstanding references"
               );
               entry.pending.push(conn);
            }
         }
      }
      (closable, removed_any)
   }

   /// Pop the whole namespace, resetting its initialization state. Returns
   /// the immediately closable connections.
   pub(crate) fn remove_namespace(&self, namespace: &str) -> Vec<Arc<SessionConnection>> {
      let mut inner = self.inner.lock();
      let Some(mut entry) = inner.remove(namespace) else {
         return Vec::new();
      };
      // Purge force-closes everything; outstanding holders will get a
      // connection-closed error on their next operation.
      let mut closable = Vec::new();
      for (_, conn) in std::mem::take(&mut entry.sessions) {
         conn.mark_removed();
         closable.push(conn);
      }
      closable.extend(entry.pending);
      closable
   }

   /// Drain pending connections whose reference counts have reached zero.
   pub(crate) fn take_reapable(&self) -> Vec<Arc<SessionConnection>> {
      let mut inner = self.inner.lock();
      let mut reapable = Vec::new();
      for entry in inner.values_mut() {
         let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.pending)
            .into_iter()
            .partition(|c| c.reference_count() == 0);
         reapable.extend(done);
         entry.pending = waiting;
      }
      reapable
   }

   /// Drop a specific connection from its namespace's pending list after its
   /// last reference was released.
   pub(crate) fn discard_pending(&self, conn: &Arc<SessionConnection>) {
      let mut inner = self.inner.lock();
      if let Some(entry) = inner.get_mut(conn.namespace()) {
         entry.pending.retain(|c| !Arc::ptr_eq(c, conn));
      }
   }

   pub(crate) fn init_state(&self, namespace: &str) -> InitState {
      self.inner
         .lock()
         .get(namespace)
         .map(|e| e.init)
         .unwrap_or_default()
   }

   pub(crate) fn set_init_state(&self, namespace: &str, state: InitState) {
      let mut inner = self.inner.lock();
      inner.entry(namespace.to_string()).or_default().init = state;
   }

   /// The per-namespace async lock serializing schema initialization.
   pub(crate) fn init_lock(&self, namespace: &str) -> Arc<tokio::sync::Mutex<()>> {
      let mut inner = self.inner.lock();
      Arc::clone(&inner.entry(namespace.to_string()).or_default().init_lock)
   }

   /// Every namespace with registry state.
   pub(crate) fn namespaces(&self) -> Vec<String> {
      self.inner.lock().keys().cloned().collect()
   }

   /// Qualifiers of the live sessions in one namespace.
   pub(crate) fn qualifiers(&self, namespace: &str) -> Vec<String> {
      self.inner
         .lock()
         .get(namespace)
         .map(|e| e.sessions.keys().cloned().collect())
         .unwrap_or_default()
   }

   /// True when any live session of `namespace` belongs to `group`.
   pub(crate) fn group_has_sessions(&self, namespace: &str, group: &str) -> bool {
      self.inner.lock().get(namespace).is_some_and(|e| {
         e.sessions
            .keys()
            .any(|q| group_of(q) == Some(group))
      })
   }

   /// Multi-line diagnostic dump of every live and pending connection.
   pub(crate) fn dump(&self) -> String {
      let inner = self.inner.lock();
      let mut out = String::new();
      for (namespace, entry) in inner.iter() {
         out.push_str(&format!(
            "namespace {namespace} init={:?} sessions={} pending={}\n",
            entry.init,
            entry.sessions.len(),
            entry.pending.len()
         ));
         for conn in entry.sessions.values() {
            out.push_str("  ");
            out.push_str(&conn.dump_line());
            out.push('\n');
         }
         for conn in &entry.pending {
            out.push_str("  (pending) ");
            out.push_str(&conn.dump_line());
            out.push('\n');
         }
      }
      out
   }
}
