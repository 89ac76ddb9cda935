//! Network access for the relay.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

use crate::error::NetworkError;
use crate::http::{Request, StoredResponse};

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
  // negotiated and decoded by the client
  "accept-encoding",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Anything that can carry a request to the origin.
///
/// Any HTTP response, whatever its status, is `Ok`. Only transport failures
/// are errors.
#[async_trait]
pub trait Network: Send + Sync {
  async fn send(&self, request: &Request) -> std::result::Result<StoredResponse, NetworkError>;
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn send(&self, request: &Request) -> std::result::Result<StoredResponse, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(classify_error)?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(classify_error)?;

    debug!(method = %request.method, url = %request.url, status, "network response");
    Ok(StoredResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

fn classify_error(e: reqwest::Error) -> NetworkError {
  if e.is_timeout() {
    NetworkError::Timeout
  } else if e.is_builder() {
    NetworkError::InvalidRequest(e.to_string())
  } else {
    NetworkError::Unreachable(e.to_string())
  }
}
