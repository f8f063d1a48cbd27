//! Metering reverse proxy from registered applications to their bound
//! provider key.
//!
//! Applications authenticate with their application id as a bearer token.
//! The gateway swaps it for the provider key's token, forwards the call, and
//! writes exactly one usage record per call: after a buffered response is
//! read, after a stream ends or breaks, when the upstream cannot be reached
//! at all, or when the caller abandons the request midway.

use std::io;

use axum::body::Body;
use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use keyward_storage::{Application, Database, ProviderKey, UsageStatus};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::extractor::{extract_buffered_usage, extract_model, UsageExtractor};
use crate::meter::UsageMeter;

/// Chunks buffered between the upstream reader and the client body.
const RELAY_CHANNEL_CAPACITY: usize = 16;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// One inbound call to forward.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    /// Path below the gateway prefix, e.g. `/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The application and key a bearer token resolved to.
#[derive(Debug, Clone)]
struct Route {
    app: Application,
    key: ProviderKey,
}

/// Forwards application traffic upstream and meters it.
#[derive(Clone)]
pub struct Gateway {
    db: Database,
    client: reqwest::Client,
}

impl Gateway {
    /// Create a gateway over the given store.
    ///
    /// The upstream client has no total timeout; long generations stream
    /// for as long as the provider keeps the connection open.
    pub fn new(db: Database) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { db, client })
    }

    /// Forward one call and return the upstream response.
    ///
    /// Errors before the upstream is contacted write no usage record.
    pub async fn forward(&self, req: GatewayRequest) -> Result<Response> {
        let app_id = bearer_token(&req.headers).ok_or(ProxyError::Unauthorized)?;
        let Route { app, key } = self.resolve(app_id)?;

        let url = target_url(&key.base_url, &req.path, req.query.as_deref());
        let endpoint = format!("/{}", req.path.trim_start_matches('/'));
        let model = extract_model(&req.body);
        let meter = UsageMeter::new(
            self.db.clone(),
            app.id.clone(),
            app.name.clone(),
            key.name.clone(),
            endpoint,
            model.clone(),
        );

        debug!(app = %app.name, key = %key.name, method = %req.method, %url, "Forwarding request");

        let upstream = self
            .client
            .request(req.method, &url)
            .headers(forwarded_headers(&req.headers))
            .bearer_auth(&key.token)
            .body(req.body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, %url, "Upstream request failed");
                meter.record_failure();
                return Err(ProxyError::UpstreamUnavailable(e.to_string()));
            }
        };

        let status = upstream.status();
        let headers = upstream.headers().clone();

        if is_streaming(&headers) {
            Ok(relay_stream(status, &headers, upstream, model, meter))
        } else {
            match upstream.bytes().await {
                Ok(body) => {
                    let usage = extract_buffered_usage(&body, &model);
                    meter.record(usage, status_for(status, false));
                    Ok(build_response(status, &headers, false, Body::from(body)))
                }
                Err(e) => {
                    warn!(error = %e, %url, "Failed to read upstream response");
                    meter.record_failure();
                    Err(ProxyError::UpstreamUnavailable(e.to_string()))
                }
            }
        }
    }

    /// Bearer id → granted application → bound key.
    ///
    /// Grant state is checked before the key, so an ungranted application is
    /// `Forbidden` whether or not it has a binding.
    fn resolve(&self, app_id: &str) -> Result<Route> {
        let app = self
            .db
            .find_app(app_id)?
            .ok_or_else(|| ProxyError::NotFound(app_id.to_string()))?;

        if !app.granted {
            return Err(ProxyError::Forbidden(app.name));
        }

        let key_id = app
            .bound_key_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProxyError::Internal(format!("no key bound to application {}", app.name)))?;

        let key = self.db.find_key(key_id)?.ok_or_else(|| {
            ProxyError::Internal(format!("key {key_id} bound to {} no longer exists", app.name))
        })?;

        if let Err(e) = self.db.touch_app(&app.id) {
            warn!(error = %e, app_id = %app.id, "Failed to refresh last activity");
        }

        Ok(Route { app, key })
    }
}

/// Join a key's base URL with the forwarded path and query.
pub fn target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Whether an upstream response is relayed chunk by chunk.
pub fn is_streaming(headers: &HeaderMap) -> bool {
    let content_type = header_str(headers, &CONTENT_TYPE);
    if content_type.contains("text/event-stream") {
        return true;
    }
    content_type.contains("text/plain") && header_str(headers, &TRANSFER_ENCODING).contains("chunked")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Caller headers minus the app credential and connection framing.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in [&AUTHORIZATION, &HOST, &CONNECTION, &KEEP_ALIVE, &TRANSFER_ENCODING, &CONTENT_LENGTH] {
        forwarded.remove(name);
    }
    forwarded
}

fn status_for(status: StatusCode, broken: bool) -> UsageStatus {
    if broken || status.as_u16() >= 400 {
        UsageStatus::Error
    } else {
        UsageStatus::Success
    }
}

fn build_response(status: StatusCode, headers: &HeaderMap, streaming: bool, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if name == TRANSFER_ENCODING || name == CONNECTION || name == KEEP_ALIVE {
            continue;
        }
        if streaming && name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder.body(body).unwrap_or_else(|_| {
        let mut response = Response::new(Body::from("failed to build response"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

/// Hand the upstream stream to a relay task and return a response whose body
/// drains the relay channel.
fn relay_stream(
    status: StatusCode,
    headers: &HeaderMap,
    upstream: reqwest::Response,
    model: String,
    meter: UsageMeter,
) -> Response {
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);

    tokio::spawn(relay(
        upstream.bytes_stream(),
        tx,
        UsageExtractor::new(model),
        meter,
        status,
    ));

    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    build_response(status, headers, true, Body::from_stream(body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    Complete,
    UpstreamFailed,
    ClientGone,
}

async fn relay<S>(
    stream: S,
    tx: mpsc::Sender<io::Result<Bytes>>,
    mut extractor: UsageExtractor,
    meter: UsageMeter,
    status: StatusCode,
) where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    tokio::pin!(stream);

    let end = loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = tx.closed() => break RelayEnd::ClientGone,
        };

        match next {
            None => break RelayEnd::Complete,
            Some(Ok(chunk)) => {
                extractor.ingest(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    break RelayEnd::ClientGone;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Upstream stream failed");
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                break RelayEnd::UpstreamFailed;
            }
        }
    };

    if end == RelayEnd::ClientGone {
        info!("Client disconnected before stream end");
    }

    meter.record(extractor.finish(), status_for(status, end != RelayEnd::Complete));
}
