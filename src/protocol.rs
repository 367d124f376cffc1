//! Messages exchanged between the coordinator and page contexts.
//!
//! The two sides share no state; everything crosses as one of these
//! messages. Replies to a sync request travel over a private one-shot
//! port created for that request.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::executor::FlushSummary;

/// Correlates a `REQUEST_SYNC` with its reply.
pub type SessionId = u64;

/// Coordinator -> page.
#[derive(Debug)]
pub enum CoordinatorMessage {
  /// "Flush your queue now." Carries the port to answer on.
  RequestSync { session: SessionId, port: ReplyPort },
}

/// Page -> coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
  /// Outcome of one flush pass
  SyncResult { success: u32, failed: u32 },
  /// Flush could not even run
  SyncError { error: String },
  /// Activate the waiting worker version now
  SkipWaiting,
}

impl From<FlushSummary> for PageMessage {
  fn from(summary: FlushSummary) -> Self {
    PageMessage::SyncResult {
      success: summary.success,
      failed: summary.failed,
    }
  }
}

/// Page-side end of a private reply channel.
#[derive(Debug)]
pub struct ReplyPort {
  session: SessionId,
  tx: oneshot::Sender<(SessionId, PageMessage)>,
}

impl ReplyPort {
  pub fn session(&self) -> SessionId {
    self.session
  }

  /// Returns false when nobody is listening any more (session timed out).
  pub fn send(self, message: PageMessage) -> bool {
    self.tx.send((self.session, message)).is_ok()
  }
}

/// Create the private channel for one session.
pub fn reply_channel(session: SessionId) -> (ReplyPort, oneshot::Receiver<(SessionId, PageMessage)>) {
  let (tx, rx) = oneshot::channel();
  (ReplyPort { session, tx }, rx)
}
