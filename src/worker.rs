//! Background worker host: version lifecycle, fetch interception and
//! dispatch of sync events to the coordinator.
//!
//! A freshly installed version activates at once when nothing is active.
//! Otherwise it waits until a page posts `SKIP_WAITING`. Activation purges
//! every cache generation that does not belong to the new version.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheStorage, ResponseSource, Served};
use crate::clients::ClientId;
use crate::config::CacheConfig;
use crate::coordinator::{SyncCoordinator, SyncHandler, SyncVerdict};
use crate::net::{FetchRequest, Fetcher};
use crate::protocol::PageMessage;

/// Result of installing a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Nothing was active; the version took over and purged these caches
  Activated { purged: Vec<String> },
  /// Another version is active; this one waits for `SKIP_WAITING`
  Waiting,
  /// The version is already active
  Unchanged,
}

struct Version<S: CacheStorage> {
  name: String,
  cache: CacheManager<S>,
}

struct Versions<S: CacheStorage> {
  active: Option<Version<S>>,
  waiting: Option<Version<S>>,
}

pub struct Worker<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  origin: Url,
  versions: Mutex<Versions<S>>,
  coordinator: Arc<SyncCoordinator>,
}

impl<S: CacheStorage + 'static> Worker<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    origin: Url,
    coordinator: Arc<SyncCoordinator>,
  ) -> Self {
    Self {
      storage,
      fetcher,
      origin,
      versions: Mutex::new(Versions {
        active: None,
        waiting: None,
      }),
      coordinator,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Versions<S>>> {
    self.versions.lock().map_err(|_| eyre!("Lock poisoned"))
  }

  pub fn active_version(&self) -> Option<String> {
    self.lock().ok()?.active.as_ref().map(|v| v.name.clone())
  }

  pub fn waiting_version(&self) -> Option<String> {
    self.lock().ok()?.waiting.as_ref().map(|v| v.name.clone())
  }

  /// Install a version: fill its shell cache, then activate it or park it.
  ///
  /// A failed install leaves the current versions as they were.
  pub async fn install(&self, config: &CacheConfig) -> Result<InstallOutcome> {
    if self.active_version().as_deref() == Some(config.version.as_str()) {
      debug!(version = %config.version, "Version already active");
      return Ok(InstallOutcome::Unchanged);
    }

    let cache = CacheManager::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
      self.origin.clone(),
      config,
    );
    cache.install().await?;

    let version = Version {
      name: config.version.clone(),
      cache,
    };
    let mut versions = self.lock()?;
    if versions.active.is_some() {
      info!(version = %version.name, "Version installed, waiting to activate");
      versions.waiting = Some(version);
      return Ok(InstallOutcome::Waiting);
    }

    let purged = version.cache.activate()?;
    info!(version = %version.name, purged = purged.len(), "Version activated");
    versions.active = Some(version);
    Ok(InstallOutcome::Activated { purged })
  }

  /// Promote the waiting version. Returns the purged cache names, or None
  /// when nothing was waiting.
  pub fn skip_waiting(&self) -> Result<Option<Vec<String>>> {
    let mut versions = self.lock()?;
    let Some(version) = versions.waiting.take() else {
      return Ok(None);
    };

    let purged = version.cache.activate()?;
    info!(version = %version.name, purged = purged.len(), "Waiting version activated");
    versions.active = Some(version);
    Ok(Some(purged))
  }

  /// Route a page request through the active version's caches. Before any
  /// version is active requests go straight to the network.
  pub async fn handle_fetch(&self, request: FetchRequest) -> Result<Served> {
    let cache = self.lock()?.active.as_ref().map(|v| v.cache.clone());
    match cache {
      Some(cache) => cache.handle(request).await,
      None => {
        let response = self.fetcher.fetch(request).await?;
        Ok(Served::new(response, ResponseSource::Passthrough))
      }
    }
  }

  /// Consume messages pages post to the worker.
  pub fn listen(
    self: Arc<Self>,
    mut rx: mpsc::UnboundedReceiver<(ClientId, PageMessage)>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      while let Some((client, message)) = rx.recv().await {
        match message {
          PageMessage::SkipWaiting => match self.skip_waiting() {
            Ok(Some(_)) => {}
            Ok(None) => debug!(client, "SKIP_WAITING with no waiting version"),
            Err(e) => warn!(client, error = %e, "Failed to activate waiting version"),
          },
          other => debug!(client, message = ?other, "Ignoring page message outside a sync session"),
        }
      }
    })
  }
}

#[async_trait]
impl<S: CacheStorage + 'static> SyncHandler for Worker<S> {
  async fn on_sync(&self, tag: &str) -> SyncVerdict {
    self.coordinator.on_sync(tag).await
  }
}
