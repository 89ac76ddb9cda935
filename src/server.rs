//! HTTP front: a local reverse proxy that runs every request through the
//! relay, plus a few control endpoints under `/__relay/`.

use axum::{
  body::{to_bytes, Body},
  extract::{Request as AxumRequest, State},
  http::{HeaderName, HeaderValue, StatusCode},
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response,
  },
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::{stream, Stream};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cache::Served;
use crate::error::RelayError;
use crate::event::RelayEvent;
use crate::http::Request;
use crate::messaging::ClientMessage;
use crate::network::is_hop_by_hop;
use crate::relay::Relay;

/// Names where a proxied response came from.
pub const SOURCE_HEADER: &str = "x-offline-relay";

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

type AppState = Arc<Relay>;

pub fn router(relay: Arc<Relay>) -> Router {
  Router::new()
    .route("/__relay/message", post(post_message))
    .route("/__relay/events", get(events))
    .route("/__relay/online", post(online))
    .route("/__relay/status", get(status))
    .fallback(intercept)
    .with_state(relay)
}

/// Serve until `shutdown` resolves, then wait for background revalidations.
pub async fn serve(
  relay: Arc<Relay>,
  listen: SocketAddr,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
  let listener = TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, origin = %relay.origin(), "relay listening");

  axum::serve(listener, router(Arc::clone(&relay)))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  relay.settle().await;
  info!("relay stopped");
  Ok(())
}

async fn intercept(State(relay): State<AppState>, request: AxumRequest) -> Response {
  let (parts, body) = request.into_parts();
  let target = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = match relay.origin().join(target) {
    Ok(url) => url,
    Err(e) => {
      return (StatusCode::BAD_REQUEST, format!("invalid request target: {}", e)).into_response()
    }
  };
  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
  };

  let mut request = Request::new(parts.method, url).with_body(body.to_vec());
  for (name, value) in &parts.headers {
    if let Ok(value) = value.to_str() {
      request = request.with_header(name.as_str(), value);
    }
  }
  request.detect_navigation();

  match relay.fetch(request).await {
    Ok(served) => served_response(served),
    Err(e) => error_response(e),
  }
}

async fn post_message(
  State(relay): State<AppState>,
  Json(message): Json<ClientMessage>,
) -> Response {
  match relay.dispatch(RelayEvent::Message(message)).await {
    Ok(_) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => error_response(e),
  }
}

async fn online(State(relay): State<AppState>) -> Response {
  match relay.outbox().replay_all().await {
    Ok(report) => Json(report).into_response(),
    Err(e) => error_response(e),
  }
}

async fn status(State(relay): State<AppState>) -> Response {
  match relay.status().await {
    Ok(status) => Json(status).into_response(),
    Err(e) => error_response(e),
  }
}

async fn events(
  State(relay): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
  let stream = stream::unfold(relay.channel().subscribe(), |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(message) => return Some((Event::default().json_data(&message), rx)),
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "event subscriber lagged"),
        Err(RecvError::Closed) => return None,
      }
    }
  });
  Sse::new(stream).keep_alive(KeepAlive::default())
}

fn served_response(served: Served) -> Response {
  let status = StatusCode::from_u16(served.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = Response::new(Body::from(served.response.body));
  *response.status_mut() = status;

  let headers = response.headers_mut();
  for (name, value) in &served.response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(
    HeaderName::from_static(SOURCE_HEADER),
    HeaderValue::from_static(served.source.as_str()),
  );
  response
}

fn error_response(e: RelayError) -> Response {
  let status = match &e {
    RelayError::Network(_) | RelayError::Install { .. } => StatusCode::BAD_GATEWAY,
    RelayError::NoActiveVersion => StatusCode::SERVICE_UNAVAILABLE,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  };
  warn!(error = %e, %status, "request failed");
  (status, Json(json!({ "error": e.to_string() }))).into_response()
}
