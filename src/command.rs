//! Bridge protocol units: enqueued commands and the result messages
//! delivered back to the embedding caller.

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// One unit of work submitted by the embedding caller. Immutable once
/// enqueued.
#[derive(Debug, Clone)]
pub(crate) enum Command {
   /// Assert a new generation for the namespace, invalidating sessions left
   /// over from previous generations.
   Initialize { namespace: String, generation: String },

   /// Execute one SQL statement inside the (generation, instance)
   /// transaction, lazily beginning it on first use.
   Stmt {
      namespace: String,
      generation: String,
      instance: i64,
      action_index: u32,
      sql: String,
      binds: Vec<Option<String>>,
   },

   /// Commit the (generation, instance) transaction and release its session.
   Commit {
      namespace: String,
      generation: String,
      instance: i64,
   },

   /// Roll back the (generation, instance) transaction and release its
   /// session.
   Rollback {
      namespace: String,
      generation: String,
      instance: i64,
   },
}

impl Command {
   pub(crate) fn namespace(&self) -> &str {
      match self {
         Command::Initialize { namespace, .. }
         | Command::Stmt { namespace, .. }
         | Command::Commit { namespace, .. }
         | Command::Rollback { namespace, .. } => namespace,
      }
   }

   pub(crate) fn generation(&self) -> &str {
      match self {
         Command::Initialize { generation, .. }
         | Command::Stmt { generation, .. }
         | Command::Commit { generation, .. }
         | Command::Rollback { generation, .. } => generation,
      }
   }
}

/// What a [`BridgeMessage`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
   /// Stale sessions from an earlier generation were torn down.
   Cleanup,
   /// A command completed; `payload` holds its result.
   Result,
   /// A command failed; `payload` holds `{"error", "errorCode"}`.
   Error,
}

/// A structured result message. The `(generation, instance, action_index)`
/// tag lets the caller correlate replies to requests; any further marshaling
/// to the embedding transport is the receiver's concern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeMessage {
   pub kind: MessageKind,
   pub namespace: String,
   pub generation: String,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub instance: Option<i64>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub action_index: Option<u32>,
   pub payload: JsonValue,
}

/// Receiver for result messages. Delivery happens on the worker task; an
/// implementation that blocks stalls the whole bridge.
pub trait ResultSink: Send + Sync + 'static {
   fn deliver(&self, message: BridgeMessage);
}

/// [`ResultSink`] forwarding messages into an unbounded channel. Convenient
/// when the embedding layer consumes results from an async task.
pub struct ChannelSink(tokio::sync::mpsc::UnboundedSender<BridgeMessage>);

impl ChannelSink {
   pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<BridgeMessage>) {
      let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
      (Self(tx), rx)
   }
}

impl ResultSink for ChannelSink {
   fn deliver(&self, message: BridgeMessage) {
      // The receiver being gone means nobody is listening anymore.
      let _ = self.0.send(message);
   }
}

/// Convert a JSON array of scalar binds into bind values: null binds as SQL
/// NULL, everything else binds as its string form.
pub(crate) fn parse_binds(binds: &JsonValue) -> Result<Vec<Option<String>>> {
   let JsonValue::Array(items) = binds else {
      if binds.is_null() {
         return Ok(Vec::new());
      }
      return Err(Error::InvalidBinds(format!(
         "expected a JSON array of scalars, got {binds}"
      )));
   };

   items
      .iter()
      .map(|item| match item {
         JsonValue::Null => Ok(None),
         JsonValue::String(s) => Ok(Some(s.clone())),
         JsonValue::Number(n) => Ok(Some(n.to_string())),
         JsonValue::Bool(b) => Ok(Some(b.to_string())),
         other => Err(Error::InvalidBinds(format!(
            "bind values must be scalars, got {other}"
         ))),
      })
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_parse_binds_scalars() {
      let binds = parse_binds(&json!(["a", 7, 1.5, null, true])).unwrap();
      assert_eq!(
         binds,
         vec![
            Some("a".to_string()),
            Some("7".to_string()),
            Some("1.5".to_string()),
            None,
            Some("true".to_string()),
         ]
      );
   }

   #[test]
   fn test_parse_binds_null_means_no_binds() {
      assert_eq!(parse_binds(&JsonValue::Null).unwrap(), Vec::<Option<String>>::new());
   }

   #[test]
   fn test_parse_binds_rejects_non_scalars() {
      assert!(matches!(
         parse_binds(&json!([{"k": 1}])),
         Err(Error::InvalidBinds(_))
      ));
      assert!(matches!(
         parse_binds(&json!({"k": 1})),
         Err(Error::InvalidBinds(_))
      ));
   }

   #[test]
   fn test_message_serialization_omits_absent_tags() {
      let message = BridgeMessage {
         kind: MessageKind::Cleanup,
         namespace: "survey".into(),
         generation: "gen1".into(),
         instance: None,
         action_index: None,
         payload: json!({}),
      };
      let value = serde_json::to_value(&message).unwrap();
      assert_eq!(value["kind"], "cleanup");
      assert!(value.get("instance").is_none());
      assert!(value.get("action_index").is_none());
   }
}
