//! Entry point pages use to record mutations.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::api::MutationApi;
use crate::background_sync::SyncScheduler;
use crate::connectivity::ConnectivityMonitor;
use crate::net::FetchResponse;
use crate::queue::{MutationId, QueueStore};

/// What happened to a submitted mutation.
#[derive(Debug)]
pub enum SubmitOutcome {
  /// Sent right away; the response is the server's, whatever its status
  Sent(FetchResponse),
  /// Stored for the next sync
  Queued(MutationId),
}

#[derive(Clone)]
pub struct MutationGateway {
  store: Arc<QueueStore>,
  api: MutationApi,
  connectivity: ConnectivityMonitor,
  scheduler: SyncScheduler,
  tag: String,
}

impl MutationGateway {
  pub fn new(
    store: Arc<QueueStore>,
    api: MutationApi,
    connectivity: ConnectivityMonitor,
    scheduler: SyncScheduler,
    tag: impl Into<String>,
  ) -> Self {
    Self {
      store,
      api,
      connectivity,
      scheduler,
      tag: tag.into(),
    }
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Queue a mutation and ask for a background sync.
  pub fn enqueue(&self, kind: &str, payload: &Value) -> Result<MutationId> {
    self.check_kind(kind)?;
    let id = self.store.enqueue(kind, payload)?;
    if !self.scheduler.register(&self.tag) {
      warn!(tag = %self.tag, "Sync scheduler stopped, mutation waits for a manual flush");
    }
    Ok(id)
  }

  /// Send now when online, otherwise queue. A transport failure while
  /// nominally online also queues; an HTTP error response does not.
  pub async fn submit(&self, kind: &str, payload: &Value) -> Result<SubmitOutcome> {
    // Unroutable payloads are rejected here rather than queued
    let request = self.api.request_for(kind, payload)?;
    if !self.is_online() {
      return self.enqueue(kind, payload).map(SubmitOutcome::Queued);
    }

    match self.api.dispatch(request).await {
      Ok(response) => Ok(SubmitOutcome::Sent(response)),
      Err(e) => {
        warn!(kind = %kind, error = %e, "Direct send failed, queueing instead");
        self.enqueue(kind, payload).map(SubmitOutcome::Queued)
      }
    }
  }

  fn check_kind(&self, kind: &str) -> Result<()> {
    if self.api.knows(kind) {
      Ok(())
    } else {
      Err(eyre!("Unknown mutation kind: {}", kind))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::coordinator::{SyncHandler, SyncVerdict};
  use crate::net::testing::{Script, ScriptedFetcher};
  use crate::net::Fetcher;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use url::Url;

  const CREATE: &str = "create-maintenance-request";
  const CREATE_PATH: &str = "/api/maintenance-requests";

  #[derive(Default)]
  struct CountingHandler {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl SyncHandler for CountingHandler {
    async fn on_sync(&self, _tag: &str) -> SyncVerdict {
      self.calls.fetch_add(1, Ordering::SeqCst);
      SyncVerdict::Complete
    }
  }

  struct Fixture {
    gateway: MutationGateway,
    store: Arc<QueueStore>,
    fetcher: Arc<ScriptedFetcher>,
    connectivity: ConnectivityMonitor,
    handler: Arc<CountingHandler>,
  }

  fn fixture(online: bool) -> Fixture {
    let config = Config::for_origin(Url::parse("https://app.example.com").unwrap());
    let store = Arc::new(QueueStore::open_in_memory(5).unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let connectivity = ConnectivityMonitor::new(online);
    let handler = Arc::new(CountingHandler::default());
    let (scheduler, _task) = SyncScheduler::spawn(handler.clone(), &connectivity, config.sync.retry.clone());
    let dyn_fetcher: Arc<dyn Fetcher> = fetcher.clone();
    let api = MutationApi::new(dyn_fetcher, config.server.base_url, config.endpoints);
    let gateway = MutationGateway::new(
      Arc::clone(&store),
      api,
      connectivity.clone(),
      scheduler,
      config.sync.tag,
    );
    Fixture {
      gateway,
      store,
      fetcher,
      connectivity,
      handler,
    }
  }

  #[tokio::test]
  async fn test_offline_submit_queues_and_registers_sync() {
    let f = fixture(false);

    let outcome = f.gateway.submit(CREATE, &json!({"unit": "4B"})).await.unwrap();

    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert_eq!(f.store.peek_all().unwrap().len(), 1);
    assert!(f.fetcher.requests().is_empty());

    f.connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_online_submit_sends_directly() {
    let f = fixture(true);
    f.fetcher.on("POST", CREATE_PATH, Script::Respond(201, "{}"));

    let outcome = f.gateway.submit(CREATE, &json!({"unit": "4B"})).await.unwrap();

    match outcome {
      SubmitOutcome::Sent(response) => assert_eq!(response.status, 201),
      other => panic!("expected Sent, got {:?}", other),
    }
    assert!(f.store.all_items().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_http_error_is_returned_not_queued() {
    let f = fixture(true);
    f.fetcher.on("POST", CREATE_PATH, Script::Respond(422, "bad unit"));

    let outcome = f.gateway.submit(CREATE, &json!({})).await.unwrap();

    match outcome {
      SubmitOutcome::Sent(response) => assert_eq!(response.status, 422),
      other => panic!("expected Sent, got {:?}", other),
    }
    assert!(f.store.all_items().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_transport_error_while_online_falls_back_to_queue() {
    let f = fixture(true);
    f.fetcher.on("POST", CREATE_PATH, Script::Fail("connection reset"));

    let outcome = f.gateway.submit(CREATE, &json!({"n": 1})).await.unwrap();

    let SubmitOutcome::Queued(id) = outcome else {
      panic!("expected Queued");
    };
    let item = f.store.get(id).unwrap().unwrap();
    assert_eq!(item.kind, CREATE);
    assert_eq!(item.payload, json!({"n": 1}));
  }

  #[tokio::test]
  async fn test_unknown_kind_is_rejected() {
    let f = fixture(false);

    assert!(f.gateway.enqueue("launch-rocket", &json!({})).is_err());
    assert!(f.gateway.submit("launch-rocket", &json!({})).await.is_err());
    assert!(f.store.all_items().unwrap().is_empty());
  }
}
