//! Local HTTP front: every request the browser makes goes through the worker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use tracing::{error, info};
use url::Url;

use crate::error::Result;
use crate::http::{Request, Response};
use crate::worker::{Event, Message, Outcome, ServiceWorker};

/// Control channel for page messages such as `{"type": "SKIP_WAITING"}`.
pub const MESSAGE_PATH: &str = "/__taskshell/message";

/// Response header naming where an answer came from.
pub const SOURCE_HEADER: &str = "x-taskshell-source";

#[derive(Clone)]
struct AppState {
  worker: Arc<ServiceWorker>,
}

#[derive(Serialize)]
struct MessageResponse {
  state: &'static str,
  retired: Vec<String>,
}

pub fn router(worker: Arc<ServiceWorker>) -> Router {
  Router::new()
    .route(MESSAGE_PATH, post(post_message))
    .fallback(intercept)
    .with_state(AppState { worker })
}

/// Bind `addr` and serve until the process stops.
pub async fn serve(addr: SocketAddr, worker: Arc<ServiceWorker>) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(addr).await?;
  info!(%addr, origin = %worker.origin(), "Serving app through worker");
  axum::serve(listener, router(worker)).await?;
  Ok(())
}

async fn intercept(
  State(state): State<AppState>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
) -> axum::response::Response {
  let request = match request_from_parts(state.worker.origin(), method, &uri, &headers) {
    Ok(request) => request,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  match state.worker.fetch(request).await {
    Ok(response) => into_http(response),
    Err(e) => {
      error!(%uri, error = %e, "Worker failed to answer");
      (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
  }
}

async fn post_message(
  State(state): State<AppState>,
  axum::Json(payload): axum::Json<serde_json::Value>,
) -> axum::response::Response {
  let message = Message::from_json(payload);
  let result = state
    .worker
    .dispatch(Event::Message(message))
    .await
    .and_then(|outcome| {
      let retired = match outcome {
        Outcome::Activated { retired } => retired,
        _ => Vec::new(),
      };
      Ok(MessageResponse {
        state: state.worker.state()?.as_str(),
        retired,
      })
    });

  match result {
    Ok(body) => axum::Json(body).into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
  }
}

/// Rebuild the page's request against the app origin.
fn request_from_parts(
  origin: &Url,
  method: Method,
  uri: &Uri,
  headers: &HeaderMap,
) -> Result<Request> {
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let mut request = Request::new(method, origin.join(path)?);
  for name in ["accept", "accept-language"] {
    if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
      request = request.with_header(name, value);
    }
  }
  Ok(request)
}

fn into_http(mut response: Response) -> axum::response::Response {
  let status = StatusCode::from_u16(response.status()).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = axum::http::Response::builder().status(status);
  for (name, value) in response.headers().iter() {
    // Body is re-framed by the server.
    if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
      continue;
    }
    builder = builder.header(name, value);
  }
  builder = builder.header(SOURCE_HEADER, response.source().as_str());

  let body = response.take_bytes().unwrap_or_default();
  builder
    .body(Body::from(body))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
