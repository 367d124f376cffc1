//! Coordinator states and the per-attempt session.

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::clients::ClientId;
use crate::protocol::{PageMessage, SessionId};

/// Why the platform should schedule another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
  /// No page context was open
  NoClient,
  /// The page never answered within the deadline
  TimedOut,
  /// Some items failed; delivered ones are already gone from the queue
  PartialFailure { success: u32, failed: u32 },
  /// The page could not run a flush at all
  FlushError(String),
  /// The page dropped the reply port without answering
  ChannelClosed,
}

/// What the coordinator reports back to the deferred-retry facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncVerdict {
  /// Nothing left to do for this registration
  Complete,
  RetryLater(RetryReason),
  /// The tag is not ours
  Ignored,
}

impl SyncVerdict {
  pub fn is_complete(&self) -> bool {
    matches!(self, SyncVerdict::Complete)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
  Idle,
  Discovering,
  AwaitingResponse { session: SessionId, client: ClientId },
  Resolved(SyncVerdict),
  TimedOut,
  NoClientAvailable,
}

impl CoordinatorState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      CoordinatorState::Resolved(_) | CoordinatorState::TimedOut | CoordinatorState::NoClientAvailable
    )
  }

  /// Allowed edges of the state machine.
  pub fn can_enter(&self, next: &CoordinatorState) -> bool {
    use CoordinatorState::*;
    match (self, next) {
      (Idle, Discovering) => true,
      (Discovering, NoClientAvailable | AwaitingResponse { .. }) => true,
      (AwaitingResponse { .. }, TimedOut | Resolved(_)) => true,
      (from, Idle) => from.is_terminal(),
      _ => false,
    }
  }
}

/// One request/response exchange with a deadline. Never persisted.
pub struct SyncSession {
  pub id: SessionId,
  pub client: ClientId,
  deadline: Instant,
  rx: oneshot::Receiver<(SessionId, PageMessage)>,
}

pub enum SessionOutcome {
  Reply(PageMessage),
  TimedOut,
  /// Port dropped, or a reply for another session
  Abandoned,
}

impl SyncSession {
  pub fn start(
    id: SessionId,
    client: ClientId,
    rx: oneshot::Receiver<(SessionId, PageMessage)>,
    timeout: Duration,
  ) -> Self {
    Self {
      id,
      client,
      deadline: Instant::now() + timeout,
      rx,
    }
  }

  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  /// Wait for the reply. The deadline timer is dropped with the session,
  /// so it cannot fire after a reply has been handled.
  pub async fn wait(self) -> SessionOutcome {
    match tokio::time::timeout_at(self.deadline, self.rx).await {
      Ok(Ok((session, message))) if session == self.id => SessionOutcome::Reply(message),
      Ok(Ok((session, _))) => {
        warn!(expected = self.id, got = session, "Reply for a different session");
        SessionOutcome::Abandoned
      }
      Ok(Err(_)) => SessionOutcome::Abandoned,
      Err(_) => SessionOutcome::TimedOut,
    }
  }
}

/// Interpret a page reply.
pub fn verdict_for(message: PageMessage) -> SyncVerdict {
  match message {
    PageMessage::SyncResult { failed: 0, .. } => SyncVerdict::Complete,
    PageMessage::SyncResult { success, failed } => {
      SyncVerdict::RetryLater(RetryReason::PartialFailure { success, failed })
    }
    PageMessage::SyncError { error } => SyncVerdict::RetryLater(RetryReason::FlushError(error)),
    PageMessage::SkipWaiting => SyncVerdict::RetryLater(RetryReason::FlushError(
      "unexpected SKIP_WAITING on sync port".to_string(),
    )),
  }
}
