//! SQLite-backed offline queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{FailOutcome, MutationId, MutationStatus, PendingSnapshot, QueuedMutation};
use crate::db;

/// Durable, ordered store of pending mutations.
///
/// Items only change through enqueue and the per-item transitions
/// `pending -> in-flight -> removed | pending | failed`. Flushing never
/// inserts, so an interrupted flush can only re-attempt existing items.
pub struct QueueStore {
  conn: Mutex<Connection>,
  max_attempts: u32,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutations_status ON mutations(status, id);

-- Single-writer flush lease, at most one row
CREATE TABLE IF NOT EXISTS flush_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const SELECT_COLUMNS: &str = "id, kind, payload, enqueued_at, attempts, status, last_error";

type RawRow = (i64, String, String, i64, u32, String, Option<String>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn into_mutation(raw: RawRow) -> Result<QueuedMutation> {
  let (id, kind, payload, enqueued_at, attempts, status, last_error) = raw;
  let payload = serde_json::from_str(&payload)
    .map_err(|e| eyre!("Failed to deserialize payload of mutation {}: {}", id, e))?;
  let enqueued_at = DateTime::from_timestamp_micros(enqueued_at)
    .ok_or_else(|| eyre!("Invalid enqueued_at {} for mutation {}", enqueued_at, id))?;

  Ok(QueuedMutation {
    id: MutationId(id),
    kind,
    payload,
    enqueued_at,
    attempts,
    status: MutationStatus::parse(&status)?,
    last_error,
  })
}

fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

impl QueueStore {
  /// Open the queue in the database at `path`.
  pub fn open(path: &Path, max_attempts: u32) -> Result<Self> {
    Self::with_connection(db::open(path)?, max_attempts)
  }

  pub fn open_in_memory(max_attempts: u32) -> Result<Self> {
    Self::with_connection(db::open_in_memory()?, max_attempts)
  }

  fn with_connection(conn: Connection, max_attempts: u32) -> Result<Self> {
    db::migrate(&conn, QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      max_attempts: max_attempts.max(1),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  /// Append a pending mutation and return its id.
  ///
  /// Errors are always returned to the caller: a lost enqueue is lost work.
  pub fn enqueue(&self, kind: &str, payload: &serde_json::Value) -> Result<MutationId> {
    let payload =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // enqueued_at is strictly increasing even when the clock is coarse
    let last: Option<i64> = tx
      .query_row("SELECT MAX(enqueued_at) FROM mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read queue tail: {}", e))?;
    let now = Utc::now().timestamp_micros();
    let enqueued_at = match last {
      Some(last) if last >= now => last + 1,
      _ => now,
    };

    tx.execute(
      "INSERT INTO mutations (kind, payload, enqueued_at) VALUES (?, ?, ?)",
      params![kind, payload, enqueued_at],
    )
    .map_err(|e| eyre!("Failed to enqueue {} mutation: {}", kind, e))?;
    let id = MutationId(tx.last_insert_rowid());

    tx.commit()
      .map_err(|e| eyre!("Failed to commit enqueue: {}", e))?;

    info!(id = %id, kind = %kind, "Mutation queued");
    Ok(id)
  }

  /// Pending items in insertion order.
  pub fn peek_all(&self) -> Result<PendingSnapshot> {
    let items = self.select_where("status = 'pending'")?;
    Ok(PendingSnapshot::new(items))
  }

  /// Every item regardless of status, in insertion order.
  pub fn all_items(&self) -> Result<Vec<QueuedMutation>> {
    self.select_where("1 = 1")
  }

  /// Terminally failed items awaiting user action.
  pub fn failed_items(&self) -> Result<Vec<QueuedMutation>> {
    self.select_where("status = 'failed'")
  }

  pub fn get(&self, id: MutationId) -> Result<Option<QueuedMutation>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM mutations WHERE id = ?", SELECT_COLUMNS),
        params![id.0],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?;

    raw.map(into_mutation).transpose()
  }

  fn select_where(&self, predicate: &str) -> Result<Vec<QueuedMutation>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM mutations WHERE {} ORDER BY id",
        SELECT_COLUMNS, predicate
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows.into_iter().map(into_mutation).collect()
  }

  fn status_of(conn: &Connection, id: MutationId) -> Result<(MutationStatus, u32)> {
    let (status, attempts): (String, u32) = conn
      .query_row(
        "SELECT status, attempts FROM mutations WHERE id = ?",
        params![id.0],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?
      .ok_or_else(|| eyre!("Mutation {} not found", id))?;

    Ok((MutationStatus::parse(&status)?, attempts))
  }

  /// pending -> in-flight
  pub fn mark_in_flight(&self, id: MutationId) -> Result<()> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE mutations SET status = 'in-flight' WHERE id = ? AND status = 'pending'",
        params![id.0],
      )
      .map_err(|e| eyre!("Failed to mark mutation {} in flight: {}", id, e))?;

    if changed == 0 {
      let (status, _) = Self::status_of(&conn, id)?;
      return Err(eyre!("Mutation {} is {}, not pending", id, status));
    }
    Ok(())
  }

  /// Remove a delivered item. Only the sync executor calls this.
  pub(crate) fn mark_succeeded(&self, id: MutationId) -> Result<()> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM mutations WHERE id = ?", params![id.0])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;

    if removed == 0 {
      return Err(eyre!("Mutation {} not found", id));
    }
    debug!(id = %id, "Mutation delivered");
    Ok(())
  }

  /// Record a failed attempt. The item returns to pending unless the
  /// attempt cap is reached, in which case it becomes terminally failed.
  pub fn mark_failed(&self, id: MutationId, error: &str) -> Result<FailOutcome> {
    let conn = self.lock()?;
    let (status, attempts) = Self::status_of(&conn, id)?;
    if status == MutationStatus::Failed {
      return Ok(FailOutcome::Terminal { attempts });
    }

    let attempts = attempts + 1;
    let (next, outcome) = if attempts >= self.max_attempts {
      (MutationStatus::Failed, FailOutcome::Terminal { attempts })
    } else {
      (MutationStatus::Pending, FailOutcome::Retrying { attempts })
    };

    conn
      .execute(
        "UPDATE mutations SET status = ?, attempts = ?, last_error = ? WHERE id = ?",
        params![next.as_str(), attempts, error, id.0],
      )
      .map_err(|e| eyre!("Failed to mark mutation {} failed: {}", id, e))?;

    match outcome {
      FailOutcome::Terminal { attempts } => {
        warn!(id = %id, attempts, error = %error, "Mutation failed permanently, needs user action")
      }
      FailOutcome::Retrying { attempts } => {
        debug!(id = %id, attempts, error = %error, "Mutation attempt failed")
      }
    }
    Ok(outcome)
  }

  /// User action: put a terminally failed item back in line with a fresh
  /// attempt budget.
  pub fn retry_failed(&self, id: MutationId) -> Result<()> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE mutations SET status = 'pending', attempts = 0 WHERE id = ? AND status = 'failed'",
        params![id.0],
      )
      .map_err(|e| eyre!("Failed to reset mutation {}: {}", id, e))?;

    if changed == 0 {
      return Err(eyre!("Mutation {} is not in the failed state", id));
    }
    info!(id = %id, "Failed mutation queued for retry");
    Ok(())
  }

  /// User action: drop a terminally failed item.
  pub fn discard(&self, id: MutationId) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM mutations WHERE id = ? AND status = 'failed'",
        params![id.0],
      )
      .map_err(|e| eyre!("Failed to discard mutation {}: {}", id, e))?;

    if removed > 0 {
      info!(id = %id, "Failed mutation discarded by user");
    }
    Ok(removed > 0)
  }

  /// Take the flush lease for `holder`.
  ///
  /// Succeeds when the lease is free, expired, or already held by
  /// `holder`. A newly taken lease also returns items stranded in-flight
  /// by a previous holder to pending.
  pub fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let now = now_millis();
    let current: Option<(String, i64)> = tx
      .query_row(
        "SELECT holder, expires_at FROM flush_lease WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read flush lease: {}", e))?;

    if let Some((current_holder, expires_at)) = &current {
      if current_holder != holder && *expires_at > now {
        debug!(holder = %current_holder, "Flush lease held elsewhere");
        return Ok(false);
      }
    }

    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    tx.execute(
      "INSERT OR REPLACE INTO flush_lease (id, holder, expires_at) VALUES (1, ?, ?)",
      params![holder, now.saturating_add(ttl_millis)],
    )
    .map_err(|e| eyre!("Failed to write flush lease: {}", e))?;

    let renewing = matches!(&current, Some((h, exp)) if h == holder && *exp > now);
    if !renewing {
      let recovered = tx
        .execute(
          "UPDATE mutations SET status = 'pending' WHERE status = 'in-flight'",
          [],
        )
        .map_err(|e| eyre!("Failed to recover in-flight mutations: {}", e))?;
      if recovered > 0 {
        warn!(recovered, "Recovered mutations stranded in flight");
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit flush lease: {}", e))?;
    Ok(true)
  }

  /// Extend the lease `holder` already owns. Returns false when another
  /// context has taken it over; the caller must stop touching items then.
  pub fn renew_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
    let conn = self.lock()?;
    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let renewed = conn
      .execute(
        "UPDATE flush_lease SET expires_at = ? WHERE id = 1 AND holder = ?",
        params![now_millis().saturating_add(ttl_millis), holder],
      )
      .map_err(|e| eyre!("Failed to renew flush lease: {}", e))?;

    if renewed == 0 {
      warn!(holder = %holder, "Flush lease lost to another context");
    }
    Ok(renewed > 0)
  }

  pub fn release_lease(&self, holder: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM flush_lease WHERE holder = ?", params![holder])
      .map_err(|e| eyre!("Failed to release flush lease: {}", e))?;
    Ok(())
  }

  /// When the current lease expires, if any.
  pub fn lease_expiry(&self) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;
    let expires_at: Option<i64> = conn
      .query_row("SELECT expires_at FROM flush_lease WHERE id = 1", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read flush lease: {}", e))?;

    Ok(expires_at.and_then(DateTime::from_timestamp_millis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store(max_attempts: u32) -> QueueStore {
    QueueStore::open_in_memory(max_attempts).unwrap()
  }

  #[test]
  fn test_enqueue_assigns_distinct_ids_and_increasing_timestamps() {
    let store = store(5);
    let ids: Vec<MutationId> = (0..20)
      .map(|i| {
        store
          .enqueue("create-maintenance-request", &json!({"n": i}))
          .unwrap()
      })
      .collect();

    let items = store.peek_all().unwrap();
    assert_eq!(items.len(), 20);
    assert_eq!(items.ids(), ids);

    let stamps: Vec<_> = items.iter().map(|m| m.enqueued_at).collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    assert!(items.iter().all(|m| m.status == MutationStatus::Pending && m.attempts == 0));
  }

  #[test]
  fn test_ids_are_not_reused_after_removal() {
    let store = store(5);
    let first = store.enqueue("k", &json!({})).unwrap();
    store.mark_in_flight(first).unwrap();
    store.mark_succeeded(first).unwrap();

    let second = store.enqueue("k", &json!({})).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_peek_all_is_restartable_and_read_only() {
    let store = store(5);
    store.enqueue("a", &json!({"x": 1})).unwrap();
    store.enqueue("b", &json!({"x": 2})).unwrap();

    let snapshot = store.peek_all().unwrap();
    let first_pass: Vec<_> = snapshot.iter().map(|m| m.kind.clone()).collect();
    let second_pass: Vec<_> = (&snapshot).into_iter().map(|m| m.kind.clone()).collect();

    assert_eq!(first_pass, vec!["a", "b"]);
    assert_eq!(first_pass, second_pass);
    assert_eq!(store.peek_all().unwrap().len(), 2);
  }

  #[test]
  fn test_in_flight_items_are_not_pending() {
    let store = store(5);
    let id = store.enqueue("k", &json!({})).unwrap();
    store.mark_in_flight(id).unwrap();

    assert!(store.peek_all().unwrap().is_empty());
    assert!(store.mark_in_flight(id).is_err());
    assert_eq!(store.get(id).unwrap().unwrap().status, MutationStatus::InFlight);
  }

  #[test]
  fn test_mark_failed_returns_item_to_pending() {
    let store = store(3);
    let id = store.enqueue("k", &json!({})).unwrap();
    store.mark_in_flight(id).unwrap();

    let outcome = store.mark_failed(id, "HTTP 500").unwrap();

    assert_eq!(outcome, FailOutcome::Retrying { attempts: 1 });
    let item = store.get(id).unwrap().unwrap();
    assert_eq!(item.status, MutationStatus::Pending);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_error.as_deref(), Some("HTTP 500"));
  }

  #[test]
  fn test_retry_cap_makes_item_terminal_but_queryable() {
    let store = store(3);
    let id = store.enqueue("k", &json!({"unit": "4B"})).unwrap();

    for expected in 1..=3 {
      store.mark_in_flight(id).unwrap();
      let outcome = store.mark_failed(id, "HTTP 422").unwrap();
      if expected < 3 {
        assert_eq!(outcome, FailOutcome::Retrying { attempts: expected });
      } else {
        assert_eq!(outcome, FailOutcome::Terminal { attempts: 3 });
      }
    }

    assert!(store.peek_all().unwrap().is_empty());
    let failed = store.failed_items().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].payload, json!({"unit": "4B"}));
    assert_eq!(store.all_items().unwrap().len(), 1);
  }

  #[test]
  fn test_user_can_retry_or_discard_failed_items() {
    let store = store(1);
    let a = store.enqueue("k", &json!({})).unwrap();
    let b = store.enqueue("k", &json!({})).unwrap();
    for id in [a, b] {
      store.mark_in_flight(id).unwrap();
      store.mark_failed(id, "boom").unwrap();
    }

    store.retry_failed(a).unwrap();
    assert!(store.discard(b).unwrap());

    let pending = store.peek_all().unwrap();
    assert_eq!(pending.ids(), vec![a]);
    assert_eq!(pending.iter().next().unwrap().attempts, 0);
    assert!(store.get(b).unwrap().is_none());

    // Only failed items can be discarded
    assert!(!store.discard(a).unwrap());
    assert!(store.retry_failed(a).is_err());
  }

  #[test]
  fn test_lease_is_exclusive_until_released() {
    let store = store(5);
    let ttl = Duration::from_secs(60);

    assert!(store.acquire_lease("tab-1", ttl).unwrap());
    assert!(!store.acquire_lease("tab-2", ttl).unwrap());
    assert!(store.acquire_lease("tab-1", ttl).unwrap());

    store.release_lease("tab-1").unwrap();
    assert!(store.lease_expiry().unwrap().is_none());
    assert!(store.acquire_lease("tab-2", ttl).unwrap());
  }

  #[test]
  fn test_expired_lease_is_taken_over_and_recovers_in_flight() {
    let store = store(5);
    let id = store.enqueue("k", &json!({})).unwrap();

    assert!(store.acquire_lease("crashed-tab", Duration::ZERO).unwrap());
    store.mark_in_flight(id).unwrap();

    assert!(store.acquire_lease("tab-2", Duration::from_secs(60)).unwrap());
    assert_eq!(store.peek_all().unwrap().ids(), vec![id]);
  }

  #[test]
  fn test_renew_fails_once_lease_is_taken_over() {
    let store = store(5);

    assert!(store.acquire_lease("tab-1", Duration::ZERO).unwrap());
    assert!(store.renew_lease("tab-1", Duration::from_secs(60)).unwrap());
    assert!(!store.acquire_lease("tab-2", Duration::from_secs(60)).unwrap());

    assert!(store.acquire_lease("tab-1", Duration::ZERO).unwrap());
    assert!(store.acquire_lease("tab-2", Duration::from_secs(60)).unwrap());
    assert!(!store.renew_lease("tab-1", Duration::from_secs(60)).unwrap());
    assert!(!store.renew_lease("tab-3", Duration::from_secs(60)).unwrap());
  }

  #[test]
  fn test_unknown_id_is_an_error() {
    let store = store(5);
    assert!(store.mark_in_flight(MutationId(42)).is_err());
    assert!(store.mark_failed(MutationId(42), "x").is_err());
    assert!(store.mark_succeeded(MutationId(42)).is_err());
  }
}
