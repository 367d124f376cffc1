//! Sync executor: drains the offline queue against the backend.
//!
//! Runs in a page context, which is where the session credential lives.
//! It is the only component that removes delivered items from the queue.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::MutationApi;
use crate::queue::{FailOutcome, QueueStore, QueuedMutation};

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSummary {
  pub success: u32,
  pub failed: u32,
}

pub struct SyncExecutor {
  store: Arc<QueueStore>,
  api: MutationApi,
  /// Lease holder name, unique per page context
  holder: String,
  lease_ttl: Duration,
}

impl SyncExecutor {
  pub fn new(
    store: Arc<QueueStore>,
    api: MutationApi,
    holder: impl Into<String>,
    lease_ttl: Duration,
  ) -> Self {
    Self {
      store,
      api,
      holder: holder.into(),
      lease_ttl,
    }
  }

  /// Attempt every pending item once, oldest first.
  ///
  /// A failing item is recorded and skipped; it never stops the items
  /// behind it. Errors mean the flush could not run at all (lease held
  /// by another context, or storage unavailable).
  pub async fn flush(&self) -> Result<FlushSummary> {
    if !self.store.acquire_lease(&self.holder, self.lease_ttl)? {
      return Err(eyre!("Another context is already flushing the queue"));
    }

    let result = self.flush_pending().await;

    if let Err(e) = self.store.release_lease(&self.holder) {
      warn!(holder = %self.holder, error = %e, "Failed to release flush lease");
    }

    if let Ok(summary) = &result {
      info!(
        success = summary.success,
        failed = summary.failed,
        "Flush pass complete"
      );
    }
    result
  }

  async fn flush_pending(&self) -> Result<FlushSummary> {
    let snapshot = self.store.peek_all()?;
    let mut summary = FlushSummary::default();

    for item in snapshot {
      if !self.store.renew_lease(&self.holder, self.lease_ttl)? {
        warn!(holder = %self.holder, "Stopping flush, lease taken over");
        break;
      }
      if let Err(e) = self.store.mark_in_flight(item.id) {
        warn!(id = %item.id, error = %e, "Skipping mutation that is no longer pending");
        continue;
      }

      let (result, lease_kept) = self.deliver_under_lease(&item).await;
      if !lease_kept {
        // The new holder already reset this item and owns its outcome
        warn!(
          id = %item.id,
          holder = %self.holder,
          "Lease lost during delivery, leaving outcome to new holder"
        );
        break;
      }

      match result {
        Ok(()) => {
          if let Err(e) = self.store.mark_succeeded(item.id) {
            warn!(id = %item.id, error = %e, "Delivered mutation vanished from the queue");
          }
          summary.success += 1;
        }
        Err(e) => {
          let reason = e.to_string();
          match self.store.mark_failed(item.id, &reason) {
            Ok(FailOutcome::Terminal { attempts }) => {
              warn!(id = %item.id, kind = %item.kind, attempts, "Mutation needs user attention")
            }
            Ok(FailOutcome::Retrying { .. }) => {}
            Err(e) => warn!(id = %item.id, error = %e, "Could not record failed attempt"),
          }
          summary.failed += 1;
        }
      }
    }

    Ok(summary)
  }

  /// Deliver one item while renewing the lease, so a slow request does not
  /// let another context take the item over. Returns whether the lease
  /// was held throughout.
  async fn deliver_under_lease(&self, item: &QueuedMutation) -> (Result<()>, bool) {
    let period = (self.lease_ttl / 3).max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let delivery = self.deliver(item);
    tokio::pin!(delivery);
    let mut lease_kept = true;

    loop {
      tokio::select! {
        result = &mut delivery => return (result, lease_kept),
        _ = heartbeat.tick(), if lease_kept => {
          match self.store.renew_lease(&self.holder, self.lease_ttl) {
            Ok(true) => {}
            Ok(false) => lease_kept = false,
            Err(e) => warn!(holder = %self.holder, error = %e, "Failed to renew flush lease"),
          }
        }
      }
    }
  }

  async fn deliver(&self, item: &QueuedMutation) -> Result<()> {
    let request = self.api.request_for(&item.kind, &item.payload)?;
    let response = self.api.dispatch(request).await?;

    if response.is_success() {
      debug!(id = %item.id, kind = %item.kind, status = response.status, "Mutation delivered");
      Ok(())
    } else {
      Err(eyre!("HTTP {}", response.status))
    }
  }
}
