//! Streaming reverse proxy to the inference server.
//!
//! A relay call authorizes the caller, rewrites the body, registers a fresh
//! [`RequestId`] and opens a streaming upstream request. The returned
//! [`CancellableStream`] owns the upstream connection and checks the
//! registry once per chunk; once the id is gone it stops and drops the
//! connection.

use std::{
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::{require_user, Principal};
use crate::config::{validate_upstream_url, ConfigResult};
use crate::error::{GatewayError, GatewayResult, SERVER_CONNECTION_ERROR};
use crate::registry::{CancellationRegistry, RequestId};
use crate::transform::BodyTransformer;

/// Model-management verbs that only administrators may call.
pub const ADMIN_VERBS: [&str; 5] = ["pull", "delete", "push", "copy", "create"];

/// Inbound headers that never reach the upstream.
const STRIPPED_REQUEST_HEADERS: [&str; 4] = ["host", "authorization", "origin", "referer"];

/// Label used when surfacing upstream error payloads.
const UPSTREAM_LABEL: &str = "Ollama";

#[derive(Debug)]
pub struct RelayRequest {
    pub method: Method,
    /// Path below the upstream base URL, e.g. `chat` or `tags`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub principal: Option<Principal>,
}

pub struct RelayResponse {
    pub request_id: RequestId,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: CancellableStream,
}

fn framing_record(id: RequestId) -> Bytes {
    let mut line = json!({ "id": id.to_string(), "done": false }).to_string();
    line.push('\n');
    Bytes::from(line)
}

/// Whether the stream for `path` starts with a framing record. Chat always
/// gets one; generate gets one unless the body asks for `"stream": false`.
pub fn emits_framing_record(path: &str, body: &[u8]) -> bool {
    match path.trim_matches('/') {
        "chat" => true,
        "generate" => !requests_non_streaming(body),
        _ => false,
    }
}

fn requests_non_streaming(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|payload| payload.get("stream").and_then(Value::as_bool))
        == Some(false)
}

/// Rejects unauthenticated or unapproved callers, and non-admins calling a
/// model-management verb.
pub fn authorize(principal: Option<Principal>, path: &str) -> GatewayResult<Principal> {
    let principal = require_user(principal)?;
    if ADMIN_VERBS.contains(&path.trim_matches('/')) && !principal.role.is_admin() {
        return Err(GatewayError::access_prohibited());
    }
    Ok(principal)
}

pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !STRIPPED_REQUEST_HEADERS
                .iter()
                .any(|stripped| name.eq_ignore_ascii_case(stripped))
                // the body may have been rewritten; reqwest recomputes framing
                && !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("transfer-encoding")
                && !name.eq_ignore_ascii_case("connection")
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Upstream headers that describe the upstream hop rather than the payload.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    const HOP_BY_HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            // framing record changes the length
            !name.eq_ignore_ascii_case("content-length")
                && !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

async fn upstream_error(response: reqwest::Response) -> GatewayError {
    let status = response.status();
    let detail = match response.json::<Value>().await {
        Ok(payload) => match payload.get("error") {
            Some(Value::String(message)) => format!("{}: {}", UPSTREAM_LABEL, message),
            Some(other) => format!("{}: {}", UPSTREAM_LABEL, other),
            None => SERVER_CONNECTION_ERROR.to_string(),
        },
        Err(e) => format!("{}: {}", UPSTREAM_LABEL, e),
    };
    GatewayError::UpstreamConnection {
        status: status.as_u16(),
        detail,
    }
}

/// Keeps a request id registered for as long as it is alive.
struct Registration {
    registry: CancellationRegistry,
    id: RequestId,
}

impl Registration {
    fn new(registry: CancellationRegistry) -> Self {
        let id = RequestId::new();
        registry.register(id);
        debug!(request_id = %id, "Registered relay request");
        Self { registry, id }
    }

    fn is_live(&self) -> bool {
        self.registry.is_live(&self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.id);
        debug!(request_id = %self.id, "Released relay request");
    }
}

/// Body of a relayed response.
///
/// Yields the framing record (if any) followed by upstream chunks for as
/// long as the request id stays registered. Dropping the stream releases
/// the id and closes the upstream connection.
pub struct CancellableStream {
    registration: Registration,
    framing: Option<Bytes>,
    upstream: Option<BoxStream<'static, GatewayResult<Bytes>>>,
}

impl CancellableStream {
    fn new(
        registration: Registration,
        framing: Option<Bytes>,
        upstream: BoxStream<'static, GatewayResult<Bytes>>,
    ) -> Self {
        Self {
            registration,
            framing,
            upstream: Some(upstream),
        }
    }

    fn finish(&mut self) {
        self.upstream = None;
        self.registration.registry.release(&self.registration.id);
    }
}

impl Stream for CancellableStream {
    type Item = GatewayResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(framing) = this.framing.take() {
            return Poll::Ready(Some(Ok(framing)));
        }

        let Some(upstream) = this.upstream.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(upstream.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                if this.registration.is_live() {
                    Poll::Ready(Some(Ok(chunk)))
                } else {
                    info!(request_id = %this.registration.id, "Client cancelled request");
                    this.finish();
                    Poll::Ready(None)
                }
            }
            Some(Err(e)) => {
                warn!(request_id = %this.registration.id, "Upstream stream failed: {}", e);
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            None => {
                debug!(request_id = %this.registration.id, "Upstream stream completed");
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamRelay {
    client: reqwest::Client,
    registry: CancellationRegistry,
    transformer: Arc<BodyTransformer>,
    upstream_base_url: Arc<RwLock<String>>,
}

impl StreamRelay {
    pub fn new(
        client: reqwest::Client,
        registry: CancellationRegistry,
        transformer: BodyTransformer,
        upstream_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            transformer: Arc::new(transformer),
            upstream_base_url: Arc::new(RwLock::new(upstream_base_url.into())),
        }
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn upstream_base_url(&self) -> String {
        self.upstream_base_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validates and installs a new upstream base URL, returning the stored
    /// form.
    pub fn set_upstream_base_url(&self, url: &str) -> ConfigResult<String> {
        let url = validate_upstream_url(url)?;
        *self
            .upstream_base_url
            .write()
            .unwrap_or_else(PoisonError::into_inner) = url.clone();
        info!("Upstream base URL set to {}", url);
        Ok(url)
    }

    pub fn cancel(&self, id: &RequestId) -> bool {
        self.registry.cancel(id)
    }

    /// Resolves `path` against the upstream base URL the way the upstream
    /// will see it. Returns the target URL and its path below the base.
    ///
    /// Dot segments are resolved and empty segments collapsed, so the
    /// returned path is exactly what gets sent. Paths that climb out of the
    /// base or still carry percent-escapes are rejected.
    fn resolve_target(&self, path: &str, query: Option<&str>) -> GatewayResult<(Url, String)> {
        let invalid = || GatewayError::InvalidRequest(format!("Invalid upstream path: {}", path));

        let base = self.upstream_base_url();
        let base_url = Url::parse(&base).map_err(|_| invalid())?;
        let mut target = Url::parse(&format!("{}/{}", base, path.trim_start_matches('/')))
            .map_err(|_| invalid())?;

        let base_segments = path_segments(&base_url);
        let target_segments = path_segments(&target);
        let relative = target_segments
            .strip_prefix(base_segments.as_slice())
            .ok_or_else(invalid)?
            .join("/");
        if relative.contains('%') {
            return Err(invalid());
        }

        let base_path = base_url.path().trim_end_matches('/').to_string();
        target.set_path(&format!("{}/{}", base_path, relative));
        target.set_query(query.filter(|q| !q.is_empty()));
        Ok((target, relative))
    }

    pub async fn relay(&self, request: RelayRequest) -> GatewayResult<RelayResponse> {
        let (target_url, path) = self.resolve_target(&request.path, request.query.as_deref())?;
        let principal = authorize(request.principal, &path)?;

        let body = self.transformer.transform(request.body).into_bytes();
        let headers = filter_request_headers(&request.headers);
        let framing = emits_framing_record(&path, &body);

        let registration = Registration::new(self.registry.clone());
        let request_id = registration.id;
        debug!(
            request_id = %request_id,
            principal = %principal.id,
            "Relaying {} {}",
            request.method,
            target_url
        );

        let response = self
            .client
            .request(request.method, target_url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(request_id = %request_id, "Failed to reach upstream {}: {}", target_url, e);
                GatewayError::UpstreamConnection {
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    detail: SERVER_CONNECTION_ERROR.to_string(),
                }
            })?;

        if !response.status().is_success() {
            warn!(
                request_id = %request_id,
                "Upstream {} answered {}",
                target_url,
                response.status()
            );
            return Err(upstream_error(response).await);
        }

        let status = response.status();
        let headers = filter_response_headers(response.headers());
        let upstream = response
            .bytes_stream()
            .map_err(|e| GatewayError::MidStream(e.to_string()))
            .boxed();

        Ok(RelayResponse {
            request_id,
            status,
            headers,
            body: CancellableStream::new(
                registration,
                framing.then(|| framing_record(request_id)),
                upstream,
            ),
        })
    }
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Builds a reqwest header map from raw name/value pairs, skipping any that
/// are not valid HTTP.
pub fn header_map_from_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> HeaderMap {
    pairs
        .into_iter()
        .filter_map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(value).ok()?;
            Some((name, value))
        })
        .collect()
}
