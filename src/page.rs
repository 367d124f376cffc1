//! Page context: the foreground side of the sync handshake.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clients::{ClientConnection, ClientId, ClientRegistry};
use crate::executor::SyncExecutor;
use crate::protocol::{CoordinatorMessage, PageMessage};

/// An open page that answers `REQUEST_SYNC` by running its executor.
pub struct PageContext {
  connection: ClientConnection,
  executor: Arc<SyncExecutor>,
}

impl PageContext {
  pub fn open(registry: &ClientRegistry, executor: Arc<SyncExecutor>) -> Self {
    Self {
      connection: registry.connect(),
      executor,
    }
  }

  pub fn id(&self) -> ClientId {
    self.connection.id()
  }

  /// Ask the worker to activate a waiting version now.
  pub fn skip_waiting(&self) -> bool {
    self.connection.post_to_worker(PageMessage::SkipWaiting)
  }

  /// Serve coordinator requests until the task is aborted.
  pub async fn run(mut self) {
    while let Some(message) = self.connection.recv().await {
      match message {
        CoordinatorMessage::RequestSync { session, port } => {
          debug!(client = self.id(), session, "Sync requested");
          let reply = match self.executor.flush().await {
            Ok(summary) => PageMessage::from(summary),
            Err(e) => PageMessage::SyncError {
              error: e.to_string(),
            },
          };
          if !port.send(reply) {
            // The session already timed out; the flush itself still counted.
            warn!(client = self.id(), session, "Sync result arrived after the coordinator gave up");
          }
        }
      }
    }
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }
}
