//! Types for queued mutations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally assigned mutation id. Never reused, even after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(pub i64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
  Pending,
  InFlight,
  /// Exceeded the attempt cap. Kept for the user to retry or discard.
  Failed,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in-flight",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "in-flight" => Ok(Self::InFlight),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown mutation status '{}'", other)),
    }
  }
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A mutation waiting to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub id: MutationId,
  /// Target operation, e.g. "create-maintenance-request"
  pub kind: String,
  /// Request body for the target endpoint
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  /// Prior flush attempts that failed
  pub attempts: u32,
  pub status: MutationStatus,
  /// Error from the most recent failed attempt
  pub last_error: Option<String>,
}

impl QueuedMutation {
  /// Human readable age, e.g. "queued 3 minutes ago".
  pub fn queued_ago(&self, now: DateTime<Utc>) -> String {
    let secs = (now - self.enqueued_at).num_seconds().max(0);
    let (amount, unit) = match secs {
      0..=59 => return "queued just now".to_string(),
      60..=3599 => (secs / 60, "minute"),
      3600..=86_399 => (secs / 3600, "hour"),
      _ => (secs / 86_400, "day"),
    };
    let plural = if amount == 1 { "" } else { "s" };
    format!("queued {} {}{} ago", amount, unit, plural)
  }
}

/// Ordered snapshot of pending mutations.
///
/// Iterating does not touch the store and can be repeated.
#[derive(Debug, Clone, Default)]
pub struct PendingSnapshot {
  items: Vec<QueuedMutation>,
}

impl PendingSnapshot {
  pub(super) fn new(items: Vec<QueuedMutation>) -> Self {
    Self { items }
  }

  pub fn iter(&self) -> std::slice::Iter<'_, QueuedMutation> {
    self.items.iter()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn ids(&self) -> Vec<MutationId> {
    self.items.iter().map(|m| m.id).collect()
  }
}

impl IntoIterator for PendingSnapshot {
  type Item = QueuedMutation;
  type IntoIter = std::vec::IntoIter<QueuedMutation>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.into_iter()
  }
}

impl<'a> IntoIterator for &'a PendingSnapshot {
  type Item = &'a QueuedMutation;
  type IntoIter = std::slice::Iter<'a, QueuedMutation>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
  /// Back to pending, will be attempted on the next flush
  Retrying { attempts: u32 },
  /// Attempt cap reached, needs user action
  Terminal { attempts: u32 },
}
