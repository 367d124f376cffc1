//! Core types for the caching system.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::net::{FetchRequest, FetchResponse};

/// Normalized identity of a cacheable request (method + URL, GET only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  method: Method,
  url: String,
}

impl RequestKey {
  /// Key for a request, or None when the request is never cached.
  pub fn for_request(request: &FetchRequest) -> Option<Self> {
    if request.method != Method::GET {
      return None;
    }
    let mut url = request.url.clone();
    url.set_fragment(None);
    Some(Self {
      method: Method::GET,
      url: url.to_string(),
    })
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: FetchResponse,
  /// Name of the cache generation it was found in
  pub cache_name: String,
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Not cacheable (cross-origin or non-GET), sent straight to the network
  Passthrough,
  /// Fresh data from network, copied into the runtime cache
  Network,
  /// Cached response, revalidating in the background
  Cache,
  /// Network unavailable, serving the offline fallback document
  OfflineFallback,
  /// Network unavailable and no fallback cached
  Offline,
}

/// Outcome of intercepting one request.
#[derive(Debug)]
pub struct Served {
  pub response: FetchResponse,
  pub source: ResponseSource,
  /// Background revalidation, present on cache hits. Dropping it detaches
  /// the task; the request path never waits on it.
  pub revalidation: Option<JoinHandle<()>>,
}

impl Served {
  pub(crate) fn new(response: FetchResponse, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      revalidation: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(url: &str) -> FetchRequest {
    FetchRequest::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_has_no_key() {
    let post = FetchRequest::new(Method::POST, Url::parse("https://a.test/x").unwrap());
    assert!(RequestKey::for_request(&post).is_none());
  }

  #[test]
  fn test_fragment_is_ignored() {
    let a = RequestKey::for_request(&get("https://a.test/page#top")).unwrap();
    let b = RequestKey::for_request(&get("https://a.test/page")).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_query_string_is_part_of_identity() {
    let a = RequestKey::for_request(&get("https://a.test/list?page=1")).unwrap();
    let b = RequestKey::for_request(&get("https://a.test/list?page=2")).unwrap();
    assert_ne!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }
}
