//! Request and response values passed between the proxy front, the strategies
//! and the network client.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Header stamped onto cached API responses (epoch millis).
pub const CACHED_AT_HEADER: &str = "cached-at";

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// Full-page navigation (as opposed to a subresource or XHR)
  pub navigate: bool,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Vec::new(),
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// GET and HEAD are the only methods that touch the partition store.
  pub fn is_read(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }

  /// Infer whether this looks like a page navigation from its headers.
  pub fn detect_navigation(&mut self) {
    let fetch_mode = self.header("sec-fetch-mode").map(|m| m == "navigate");
    let wants_html = self
      .header("accept")
      .map(|a| a.starts_with("text/html"))
      .unwrap_or(false);
    self.navigate = fetch_mode.unwrap_or(self.method == Method::GET && wants_html);
  }

  /// Canonical cache identity. Every read-level request keys as a GET.
  pub fn key(&self) -> RequestKey {
    RequestKey::for_url(&self.url)
  }
}

/// Stable, fixed-length identity of a cached request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn for_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(b"GET ");
    hasher.update(url.as_str().as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn from_stored(key: String) -> Self {
    Self(key)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// A response as held in (or synthesized for) the partition store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Set a header, replacing any existing value with the same name.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
    self
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
