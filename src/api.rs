//! Routing of mutation kinds to the backend's REST endpoints.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::config::EndpointConfig;
use crate::net::{FetchRequest, FetchResponse, Fetcher};

/// Sends mutation payloads to their endpoints with the session credential.
///
/// Response bodies are opaque; callers only look at the status code.
#[derive(Clone)]
pub struct MutationApi {
  fetcher: Arc<dyn Fetcher>,
  base_url: Url,
  endpoints: BTreeMap<String, EndpointConfig>,
  token: Option<String>,
}

impl MutationApi {
  pub fn new(
    fetcher: Arc<dyn Fetcher>,
    base_url: Url,
    endpoints: BTreeMap<String, EndpointConfig>,
  ) -> Self {
    Self {
      fetcher,
      base_url,
      endpoints,
      token: None,
    }
  }

  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }

  pub fn knows(&self, kind: &str) -> bool {
    self.endpoints.contains_key(kind)
  }

  /// Build the request for `kind`. Fails for unknown kinds and for
  /// payloads missing a field the endpoint path needs.
  pub fn request_for(&self, kind: &str, payload: &Value) -> Result<FetchRequest> {
    let endpoint = self
      .endpoints
      .get(kind)
      .ok_or_else(|| eyre!("No endpoint configured for mutation kind '{}'", kind))?;

    let method = Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}' for {}: {}", endpoint.method, kind, e))?;
    let path = fill_path(&endpoint.path, payload)
      .map_err(|e| eyre!("Cannot route {} mutation: {}", kind, e))?;
    let url = self
      .base_url
      .join(&path)
      .map_err(|e| eyre!("Invalid endpoint path {}: {}", path, e))?;

    let mut request = FetchRequest::new(method, url)
      .with_json(payload)?
      .with_header("accept", "application/json");
    if let Some(token) = &self.token {
      request = request.with_header("authorization", format!("Bearer {}", token));
    }
    Ok(request)
  }

  /// Perform a built request. `Err` means the request never got a response.
  pub async fn dispatch(&self, request: FetchRequest) -> Result<FetchResponse> {
    self.fetcher.fetch(request).await
  }

  pub async fn send(&self, kind: &str, payload: &Value) -> Result<FetchResponse> {
    let request = self.request_for(kind, payload)?;
    self.dispatch(request).await
  }
}

/// Replace `{field}` segments with top-level string or number fields of
/// the payload.
fn fill_path(template: &str, payload: &Value) -> Result<String> {
  let mut path = String::with_capacity(template.len());
  let mut rest = template;

  while let Some(start) = rest.find('{') {
    let end = rest[start..]
      .find('}')
      .map(|i| start + i)
      .ok_or_else(|| eyre!("Unclosed placeholder in '{}'", template))?;
    let field = &rest[start + 1..end];

    let value = match payload.get(field) {
      Some(Value::String(s)) => s.clone(),
      Some(Value::Number(n)) => n.to_string(),
      _ => return Err(eyre!("payload has no string or number field '{}'", field)),
    };
    // Dot segments would be normalised away by the URL parser
    let dot_segment = value == "." || value == "..";
    if value.is_empty() || dot_segment || value.contains(&['/', '?', '#'][..]) {
      return Err(eyre!("field '{}' is not a valid path segment", field));
    }

    path.push_str(&rest[..start]);
    path.push_str(&value);
    rest = &rest[end + 1..];
  }
  path.push_str(rest);

  Ok(path)
}
