//! Deferred-retry facility: runs registered sync tags once connectivity
//! allows, backing off between failed attempts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::{SyncHandler, SyncVerdict};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Handle for registering sync tags. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
  tx: mpsc::UnboundedSender<String>,
}

struct Registration {
  failures: u32,
  next_at: Instant,
}

struct SchedulerLoop {
  handler: Arc<dyn SyncHandler>,
  retry: RetryConfig,
  registrations: BTreeMap<String, Registration>,
  /// Tags dropped after too many failures, re-armed when we come back online
  given_up: BTreeSet<String>,
}

impl SyncScheduler {
  pub fn spawn(
    handler: Arc<dyn SyncHandler>,
    connectivity: &ConnectivityMonitor,
    retry: RetryConfig,
  ) -> (Self, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = SchedulerLoop {
      handler,
      retry,
      registrations: BTreeMap::new(),
      given_up: BTreeSet::new(),
    };
    let handle = tokio::spawn(state.run(rx, connectivity.subscribe()));
    (Self { tx }, handle)
  }

  /// Ask for `tag` to be synced. Registering a tag that is already pending
  /// does nothing. Returns false if the scheduler has stopped.
  pub fn register(&self, tag: &str) -> bool {
    self.tx.send(tag.to_string()).is_ok()
  }
}

impl SchedulerLoop {
  async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>, mut online: watch::Receiver<bool>) {
    let mut watching = true;
    loop {
      let due = if *online.borrow() {
        self.registrations.values().map(|r| r.next_at).min()
      } else {
        None
      };

      tokio::select! {
        message = rx.recv() => match message {
          Some(tag) => self.register(tag),
          None => break,
        },
        changed = online.changed(), if watching => {
          if changed.is_err() {
            watching = false;
            continue;
          }
          if *online.borrow_and_update() {
            self.rearm();
          }
        }
        _ = wait_until(due) => {
          self.run_due().await;
        }
      }
    }
    debug!("Sync scheduler stopped");
  }

  fn register(&mut self, tag: String) {
    self.given_up.remove(&tag);
    if self.registrations.contains_key(&tag) {
      debug!(tag = %tag, "Sync already registered");
      return;
    }
    debug!(tag = %tag, "Sync registered");
    self.registrations.insert(
      tag,
      Registration {
        failures: 0,
        next_at: Instant::now(),
      },
    );
  }

  /// Coming back online fires everything immediately.
  fn rearm(&mut self) {
    let now = Instant::now();
    for tag in std::mem::take(&mut self.given_up) {
      self.registrations.insert(
        tag,
        Registration {
          failures: 0,
          next_at: now,
        },
      );
    }
    for registration in self.registrations.values_mut() {
      registration.next_at = now;
    }
  }

  async fn run_due(&mut self) {
    let now = Instant::now();
    let due: Vec<String> = self
      .registrations
      .iter()
      .filter(|(_, r)| r.next_at <= now)
      .map(|(tag, _)| tag.clone())
      .collect();

    for tag in due {
      let verdict = self.handler.on_sync(&tag).await;
      match verdict {
        SyncVerdict::Complete | SyncVerdict::Ignored => {
          self.registrations.remove(&tag);
          debug!(tag = %tag, verdict = ?verdict, "Sync registration settled");
        }
        SyncVerdict::RetryLater(reason) => {
          let Some(registration) = self.registrations.get_mut(&tag) else {
            continue;
          };
          registration.failures += 1;
          let failures = registration.failures;
          if failures >= self.retry.max_attempts {
            warn!(
              tag = %tag,
              attempts = failures,
              reason = ?reason,
              "Sync failed after max attempts, waiting for the next trigger"
            );
            self.registrations.remove(&tag);
            self.given_up.insert(tag);
          } else {
            let delay = self.retry.delay_after(failures);
            registration.next_at = retry_at(Instant::now(), delay);
            info!(tag = %tag, attempt = failures, reason = ?reason, next_in = ?delay, "Sync will be retried");
          }
        }
      }
    }
  }
}

/// `now + delay`, saturating to a year out for delays `Instant` cannot hold.
fn retry_at(now: Instant, delay: Duration) -> Instant {
  now
    .checked_add(delay)
    .or_else(|| now.checked_add(FAR_FUTURE))
    .unwrap_or(now)
}

async fn wait_until(due: Option<Instant>) {
  match due {
    Some(at) => sleep_until(at).await,
    None => std::future::pending().await,
  }
}
