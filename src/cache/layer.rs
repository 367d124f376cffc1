//! Cache manager: shell install, generation purge and fetch interception.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey, ResponseSource, Served};
use crate::config::CacheConfig;
use crate::net::{FetchRequest, FetchResponse, Fetcher};

/// Owns the shell and runtime caches of one deployed version.
///
/// Only this type writes to the runtime cache, and only with responses
/// that came back from the network with status 200.
pub struct CacheManager<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  origin: Url,
  shell_cache: String,
  runtime_cache: String,
  shell_assets: Vec<String>,
  offline_fallback: Option<String>,
}

impl<S: CacheStorage + 'static> CacheManager<S> {
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn Fetcher>, origin: Url, config: &CacheConfig) -> Self {
    Self {
      storage,
      fetcher,
      origin,
      shell_cache: config.shell_cache_name(),
      runtime_cache: config.runtime_cache_name(),
      shell_assets: config.shell_assets.clone(),
      offline_fallback: config.offline_fallback.clone(),
    }
  }

  pub fn shell_cache(&self) -> &str {
    &self.shell_cache
  }

  pub fn runtime_cache(&self) -> &str {
    &self.runtime_cache
  }

  /// Pre-populate the shell cache.
  ///
  /// Every asset is fetched before anything is written; one failure fails
  /// the install and leaves the shell cache untouched.
  pub async fn install(&self) -> Result<usize> {
    let requests = self
      .shell_assets
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(FetchRequest::get)
          .map_err(|e| eyre!("Invalid shell asset path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.into_iter().map(|request| {
      let fetcher = Arc::clone(&self.fetcher);
      async move {
        let key = RequestKey::for_request(&request)
          .ok_or_else(|| eyre!("Shell asset {} is not cacheable", request.url))?;
        let url = request.url.clone();
        let response = fetcher.fetch(request).await?;
        if response.status != 200 {
          return Err(eyre!(
            "Shell asset {} returned status {}",
            url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((key, response))
      }
    });

    let entries = futures::future::try_join_all(fetches)
      .await
      .map_err(|e| eyre!("Install of {} aborted: {}", self.shell_cache, e))?;

    self.storage.put_all(&self.shell_cache, &entries)?;
    info!(cache = %self.shell_cache, assets = entries.len(), "Shell cache installed");

    Ok(entries.len())
  }

  /// Delete every cache generation other than this version's pair.
  ///
  /// Returns the names that were purged.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.storage.open_cache(&self.runtime_cache)?;

    let mut purged = Vec::new();
    for name in self.storage.cache_names()? {
      if name == self.shell_cache || name == self.runtime_cache {
        continue;
      }
      if self.storage.delete_cache(&name)? {
        info!(cache = %name, "Purged stale cache");
        purged.push(name);
      }
    }

    Ok(purged)
  }

  /// Intercept a request.
  ///
  /// 1. Cross-origin and non-GET requests go straight to the network
  /// 2. Cache hit: return it now and revalidate in the background
  /// 3. Cache miss: fetch, keep a copy of 200 responses
  /// 4. Network failure: serve the offline fallback, or a synthesized one
  ///
  /// Only the passthrough path can return an error.
  pub async fn handle(&self, request: FetchRequest) -> Result<Served> {
    let key = match RequestKey::for_request(&request) {
      Some(key) if request.is_same_origin(&self.origin) => key,
      _ => {
        let response = self.fetcher.fetch(request).await?;
        return Ok(Served::new(response, ResponseSource::Passthrough));
      }
    };

    if let Some(cached) = self.lookup(&key) {
      debug!(url = %key.url(), cache = %cached.cache_name, "Serving from cache");
      let revalidation = self.spawn_revalidation(request, key);
      return Ok(Served {
        response: cached.response,
        source: ResponseSource::Cache,
        revalidation: Some(revalidation),
      });
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          if let Err(e) = self.storage.put(&self.runtime_cache, &key, &response) {
            warn!(url = %key.url(), error = %e, "Failed to store response in runtime cache");
          }
        }
        Ok(Served::new(response, ResponseSource::Network))
      }
      Err(e) => {
        debug!(url = %key.url(), error = %e, "Network unavailable, serving offline response");
        Ok(self.offline_response())
      }
    }
  }

  /// Runtime copies are newer than shell copies, so they are checked first.
  fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    let names = [self.runtime_cache.clone(), self.shell_cache.clone()];
    match self.storage.match_any(&names, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(url = %key.url(), error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn offline_response(&self) -> Served {
    let fallback = self
      .offline_fallback
      .as_deref()
      .and_then(|path| self.origin.join(path).ok())
      .and_then(|url| RequestKey::for_request(&FetchRequest::get(url)))
      .and_then(|key| self.lookup(&key));

    match fallback {
      Some(cached) => Served::new(cached.response, ResponseSource::OfflineFallback),
      None => Served::new(FetchResponse::offline(), ResponseSource::Offline),
    }
  }

  fn spawn_revalidation(&self, request: FetchRequest, key: RequestKey) -> tokio::task::JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);
    let runtime_cache = self.runtime_cache.clone();

    tokio::spawn(async move {
      match fetcher.fetch(request).await {
        Ok(response) if response.status == 200 => {
          match storage.put(&runtime_cache, &key, &response) {
            Ok(()) => debug!(url = %key.url(), "Revalidated cached response"),
            Err(e) => warn!(url = %key.url(), error = %e, "Failed to store revalidated response"),
          }
        }
        Ok(response) => {
          debug!(url = %key.url(), status = response.status, "Revalidation not OK, keeping cached copy");
        }
        Err(e) => {
          debug!(url = %key.url(), error = %e, "Revalidation failed, keeping cached copy");
        }
      }
    })
  }
}

impl<S: CacheStorage> Clone for CacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      origin: self.origin.clone(),
      shell_cache: self.shell_cache.clone(),
      runtime_cache: self.runtime_cache.clone(),
      shell_assets: self.shell_assets.clone(),
      offline_fallback: self.offline_fallback.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::testing::{Script, ScriptedFetcher};
  use reqwest::Method;
  use std::time::Duration;

  fn origin() -> Url {
    Url::parse("https://app.example.com").unwrap()
  }

  fn config(version: &str) -> CacheConfig {
    CacheConfig {
      version: version.to_string(),
      shell_assets: vec!["/".to_string(), "/manifest.json".to_string()],
      offline_fallback: Some("/offline.html".to_string()),
    }
  }

  fn manager(
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<ScriptedFetcher>,
    version: &str,
  ) -> CacheManager<SqliteStorage> {
    let fetcher: Arc<dyn Fetcher> = fetcher.clone();
    CacheManager::new(Arc::clone(storage), fetcher, origin(), &config(version))
  }

  fn get(path: &str) -> FetchRequest {
    FetchRequest::get(origin().join(path).unwrap())
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::for_request(&get(path)).unwrap()
  }

  #[tokio::test]
  async fn test_install_populates_shell_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher
      .on("GET", "/", Script::Respond(200, "<html>"))
      .on("GET", "/manifest.json", Script::Respond(200, "{}"));

    let installed = manager(&storage, &fetcher, "v1").install().await.unwrap();

    assert_eq!(installed, 2);
    assert!(storage.get("v1-shell", &key("/")).unwrap().is_some());
    assert!(storage.get("v1-shell", &key("/manifest.json")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher
      .on("GET", "/", Script::Respond(200, "<html>"))
      .on("GET", "/manifest.json", Script::Respond(404, "missing"));

    assert!(manager(&storage, &fetcher, "v1").install().await.is_err());
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_keeps_only_current_pair() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let page = FetchResponse::new(200, "x");
    storage.put("v1-shell", &key("/"), &page).unwrap();
    storage.put("v1-runtime", &key("/a"), &page).unwrap();
    storage.put("v2-shell", &key("/"), &page).unwrap();

    let mut purged = manager(&storage, &fetcher, "v2").activate().unwrap();
    purged.sort();

    assert_eq!(purged, vec!["v1-runtime".to_string(), "v1-shell".to_string()]);
    let mut names = storage.cache_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["v2-runtime".to_string(), "v2-shell".to_string()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cache_hit_returns_immediately_and_revalidates() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.on(
      "GET",
      "/inspections",
      Script::Delayed(
        Duration::from_secs(5),
        Box::new(Script::Respond(200, "fresh")),
      ),
    );
    storage
      .put("v1-runtime", &key("/inspections"), &FetchResponse::new(200, "stale"))
      .unwrap();

    let start = tokio::time::Instant::now();
    let served = manager(&storage, &fetcher, "v1")
      .handle(get("/inspections"))
      .await
      .unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body_text(), "stale");

    served.revalidation.unwrap().await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(5));
    let cached = storage.get("v1-runtime", &key("/inspections")).unwrap().unwrap();
    assert_eq!(cached.response.body_text(), "fresh");
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_cached_copy() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.on("GET", "/", Script::Fail("connection refused"));
    storage
      .put("v1-shell", &key("/"), &FetchResponse::new(200, "shell"))
      .unwrap();

    let served = manager(&storage, &fetcher, "v1").handle(get("/")).await.unwrap();
    served.revalidation.unwrap().await.unwrap();

    assert_eq!(served.response.body_text(), "shell");
    assert!(storage.get("v1-runtime", &key("/")).unwrap().is_none());
    assert!(storage.get("v1-shell", &key("/")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_miss_stores_ok_response_only() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher
      .on("GET", "/ok", Script::Respond(200, "body"))
      .on("GET", "/gone", Script::Respond(404, "nope"));
    let manager = manager(&storage, &fetcher, "v1");

    let ok = manager.handle(get("/ok")).await.unwrap();
    let gone = manager.handle(get("/gone")).await.unwrap();

    assert_eq!(ok.source, ResponseSource::Network);
    assert_eq!(gone.response.status, 404);
    assert!(storage.get("v1-runtime", &key("/ok")).unwrap().is_some());
    assert!(storage.get("v1-runtime", &key("/gone")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_miss_serves_fallback_document() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    storage
      .put("v1-shell", &key("/offline.html"), &FetchResponse::new(200, "offline page"))
      .unwrap();

    let served = manager(&storage, &fetcher, "v1")
      .handle(get("/reports/12"))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.body_text(), "offline page");
  }

  #[tokio::test]
  async fn test_offline_miss_without_fallback_synthesizes_response() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());

    let served = manager(&storage, &fetcher, "v1")
      .handle(get("/reports/12"))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Offline);
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.body_text(), "Offline");
  }

  #[tokio::test]
  async fn test_cross_origin_and_non_get_bypass_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher
      .on("GET", "/lib.js", Script::Respond(200, "cdn"))
      .on("POST", "/api/maintenance-requests", Script::Respond(201, "created"));
    let manager = manager(&storage, &fetcher, "v1");

    let cdn = FetchRequest::get(Url::parse("https://cdn.example.net/lib.js").unwrap());
    let post = FetchRequest::new(Method::POST, origin().join("/api/maintenance-requests").unwrap());

    assert_eq!(
      manager.handle(cdn).await.unwrap().source,
      ResponseSource::Passthrough
    );
    assert_eq!(
      manager.handle(post).await.unwrap().source,
      ResponseSource::Passthrough
    );
    assert!(storage.cache_names().unwrap().is_empty());

    let offline_post =
      FetchRequest::new(Method::POST, origin().join("/api/unscripted").unwrap());
    assert!(manager.handle(offline_post).await.is_err());
  }
}
