//! Catch-all HTTP handler that forwards public requests into tunnels.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use backhaul_shared::protocol::{fold_headers, is_hop_by_hop};
use http_body_util::LengthLimitError;
use tracing::{debug, warn};

use crate::dispatch::{ProxyRequest, ProxyResponse};
use crate::error::DispatchError;
use crate::AppState;

pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let tunnel = &state.config.tunnel;

    let identifier = req
        .headers()
        .get(tunnel.identifier_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    let Some(identifier) = identifier else {
        debug!(header = %tunnel.identifier_header, "request without identifier header");
        return (StatusCode::BAD_GATEWAY, "private server not found").into_response();
    };

    let declared_len = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > tunnel.max_body_bytes) {
        return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let headers = fold_headers(
        req.headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );

    let body = match to_bytes(req.into_body(), tunnel.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) if exceeds_limit(&e) => {
            debug!(%identifier, limit = tunnel.max_body_bytes, "request body over limit");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
        Err(e) => {
            warn!(%identifier, error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let request = ProxyRequest {
        method,
        path,
        query,
        headers,
        body,
    };

    match state
        .dispatcher
        .dispatch(&identifier, request, state.config.request_timeout())
        .await
    {
        Ok(response) => into_http_response(response),
        Err(e) => e.into_response(),
    }
}

/// Whether a body read failed on the size limit rather than on I/O
fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Convert a tunneled response into an HTTP response, dropping
/// connection-scoped and unrepresentable headers.
pub fn into_http_response(response: ProxyResponse) -> Response {
    let Ok(status) = StatusCode::from_u16(response.status) else {
        return DispatchError::InvalidStatus(response.status).into_response();
    };

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &response.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %name, "skipping unrepresentable response header"),
            }
        }
    }

    match builder.body(Body::from(response.body)) {
        Ok(resp) => resp,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}
