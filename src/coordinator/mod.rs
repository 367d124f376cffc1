//! Sync coordinator: the background side of the sync handshake.
//!
//! ```text
//! Idle -> Discovering -> AwaitingResponse -> Resolved | TimedOut -> Idle
//!              \-> NoClientAvailable -> Idle
//! ```
//!
//! The coordinator owns no queue state. It finds an open page, hands it a
//! private reply port inside `REQUEST_SYNC`, waits up to the handshake
//! deadline and turns the answer into a verdict for the retry facility.
//! A timeout ends the session only; the page's in-flight requests run to
//! completion with nobody listening.

mod state;

pub use state::{CoordinatorState, RetryReason, SessionOutcome, SyncSession, SyncVerdict};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clients::ClientRegistry;
use crate::protocol::{reply_channel, CoordinatorMessage};

/// Something the deferred-retry facility can invoke for a tag.
#[async_trait]
pub trait SyncHandler: Send + Sync {
  async fn on_sync(&self, tag: &str) -> SyncVerdict;
}

/// Record of one coordinator run.
#[derive(Debug, Clone)]
pub struct SyncReport {
  pub verdict: SyncVerdict,
  /// States entered after the initial Idle, in order
  pub path: Vec<CoordinatorState>,
}

pub struct SyncCoordinator {
  clients: ClientRegistry,
  tag: String,
  timeout: Duration,
  next_session: AtomicU64,
  observed: watch::Sender<CoordinatorState>,
}

/// State machine for a single run, built fresh each time.
struct SyncRun<'a> {
  state: CoordinatorState,
  path: Vec<CoordinatorState>,
  observed: &'a watch::Sender<CoordinatorState>,
}

impl<'a> SyncRun<'a> {
  fn new(observed: &'a watch::Sender<CoordinatorState>) -> Self {
    Self {
      state: CoordinatorState::Idle,
      path: Vec::new(),
      observed,
    }
  }

  fn enter(&mut self, next: CoordinatorState) {
    if !self.state.can_enter(&next) {
      warn!(from = ?self.state, to = ?next, "Unexpected coordinator transition");
    }
    debug!(from = ?self.state, to = ?next, "Coordinator transition");
    self.state = next.clone();
    self.path.push(next.clone());
    self.observed.send_replace(next);
  }

  fn finish(mut self, verdict: SyncVerdict) -> SyncReport {
    self.enter(CoordinatorState::Idle);
    SyncReport {
      verdict,
      path: self.path,
    }
  }
}

impl SyncCoordinator {
  pub fn new(clients: ClientRegistry, tag: impl Into<String>, timeout: Duration) -> Self {
    let (observed, _rx) = watch::channel(CoordinatorState::Idle);
    Self {
      clients,
      tag: tag.into(),
      timeout,
      next_session: AtomicU64::new(1),
      observed,
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// Most recently entered state.
  pub fn state(&self) -> CoordinatorState {
    self.observed.borrow().clone()
  }

  pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
    self.observed.subscribe()
  }

  /// Run one discovery + handshake cycle. Never fails: every problem
  /// becomes a `RetryLater` verdict.
  pub async fn run(&self) -> SyncReport {
    let mut run = SyncRun::new(&self.observed);
    run.enter(CoordinatorState::Discovering);

    let client = match self.clients.discover() {
      Some(client) => client,
      None => {
        info!("No open page to run the sync, deferring");
        run.enter(CoordinatorState::NoClientAvailable);
        return run.finish(SyncVerdict::RetryLater(RetryReason::NoClient));
      }
    };

    let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
    let (port, rx) = reply_channel(session_id);
    if !client.post(CoordinatorMessage::RequestSync {
      session: session_id,
      port,
    }) {
      info!(client = client.id, "Page closed before the sync request was delivered");
      run.enter(CoordinatorState::NoClientAvailable);
      return run.finish(SyncVerdict::RetryLater(RetryReason::NoClient));
    }

    let session = SyncSession::start(session_id, client.id, rx, self.timeout);
    run.enter(CoordinatorState::AwaitingResponse {
      session: session.id,
      client: session.client,
    });

    let verdict = match session.wait().await {
      SessionOutcome::Reply(message) => {
        let verdict = state::verdict_for(message);
        run.enter(CoordinatorState::Resolved(verdict.clone()));
        verdict
      }
      SessionOutcome::TimedOut => {
        warn!(session = session_id, timeout = ?self.timeout, "Sync handshake timed out");
        run.enter(CoordinatorState::TimedOut);
        SyncVerdict::RetryLater(RetryReason::TimedOut)
      }
      SessionOutcome::Abandoned => {
        let verdict = SyncVerdict::RetryLater(RetryReason::ChannelClosed);
        run.enter(CoordinatorState::Resolved(verdict.clone()));
        verdict
      }
    };

    match &verdict {
      SyncVerdict::Complete => info!(session = session_id, "Sync complete"),
      other => info!(session = session_id, verdict = ?other, "Sync needs another attempt"),
    }
    run.finish(verdict)
  }
}

#[async_trait]
impl SyncHandler for SyncCoordinator {
  async fn on_sync(&self, tag: &str) -> SyncVerdict {
    if tag != self.tag {
      debug!(tag = %tag, "Ignoring sync for another subsystem");
      return SyncVerdict::Ignored;
    }
    self.run().await.verdict
  }
}
