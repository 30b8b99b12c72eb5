//! The bounded FIFO command queue feeding the worker.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::command::Command;
use crate::{Error, Result};

/// Default queue capacity; enough to absorb a burst from the embedding
/// caller without letting a misbehaving one build an unbounded backlog.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Configuration for a [`crate::SqliteBridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
   /// Maximum number of commands waiting to be executed.
   ///
   /// Default: 10
   pub queue_capacity: usize,
}

impl Default for BridgeConfig {
   fn default() -> Self {
      Self {
         queue_capacity: DEFAULT_QUEUE_CAPACITY,
      }
   }
}

/// Submission side of the queue. Never blocks: a full queue is an immediate
/// [`Error::QueueFull`] and the caller must retry.
pub(crate) struct CommandQueue {
   tx: mpsc::Sender<Command>,
}

impl CommandQueue {
   pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
      let (tx, rx) = mpsc::channel(capacity.max(1));
      (Self { tx }, rx)
   }

   pub(crate) fn submit(&self, command: Command) -> Result<()> {
      self.tx.try_send(command).map_err(|e| match e {
         TrySendError::Full(_) => Error::QueueFull,
         TrySendError::Closed(_) => Error::Closed,
      })
   }
}
