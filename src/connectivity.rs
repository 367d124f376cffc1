//! Online/offline signal shared by everything that does network I/O.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use url::Url;

use crate::net::{FetchRequest, Fetcher};

/// Observable connectivity flag.
///
/// Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Returns true when this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Periodically probe `url`; any HTTP response counts as online.
  pub fn spawn_probe(
    &self,
    fetcher: Arc<dyn Fetcher>,
    url: Url,
    interval: Duration,
  ) -> tokio::task::JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let online = fetcher
          .fetch(FetchRequest::new(reqwest::Method::HEAD, url.clone()))
          .await
          .is_ok();
        monitor.set_online(online);
      }
    })
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::{Script, ScriptedFetcher};

  #[test]
  fn test_set_online_reports_transitions_only() {
    let monitor = ConnectivityMonitor::new(true);

    assert!(!monitor.set_online(true));
    assert!(monitor.set_online(false));
    assert!(!monitor.is_online());
    assert!(monitor.set_online(true));
  }

  #[tokio::test]
  async fn test_subscribers_see_changes() {
    let monitor = ConnectivityMonitor::new(false);
    let mut rx = monitor.subscribe();

    let other_handle = monitor.clone();
    other_handle.set_online(true);

    rx.changed().await.unwrap();
    assert!(*rx.borrow());
    assert!(monitor.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_follows_reachability() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher
      .on("HEAD", "/api/health", Script::Fail("offline"))
      .on("HEAD", "/api/health", Script::Respond(503, ""));
    let monitor = ConnectivityMonitor::new(true);
    let mut rx = monitor.subscribe();

    let probe = monitor.spawn_probe(
      fetcher.clone(),
      Url::parse("https://app.example.com/api/health").unwrap(),
      Duration::from_secs(15),
    );

    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());

    probe.abort();
  }
}
