//! Local proxy for forwarding tunneled requests

use anyhow::Result;
use backhaul_shared::protocol::{fold_headers, is_hop_by_hop, TunneledRequest, TunneledResponse};
use tracing::warn;

/// HTTP client used for the local service. Redirects are passed back to
/// the caller instead of being followed.
pub fn build_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Full local URL for a tunneled request
pub fn target_url(target: &str, path: &str, query: &str) -> String {
    let mut url = format!("{}{}", target.trim_end_matches('/'), path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Forward a request to the local service. Local failures become a 502
/// response so the public caller still gets an answer.
pub async fn forward(
    client: &reqwest::Client,
    target: &str,
    request: TunneledRequest,
) -> TunneledResponse {
    let request_id = request.request_id.clone();
    match try_forward(client, target, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, "Local service error: {}", e);
            TunneledResponse {
                request_id,
                status_code: 502,
                header: fold_headers([("Content-Type", "text/plain")]),
                body: format!("local service error: {}", e).into_bytes(),
            }
        }
    }
}

async fn try_forward(
    client: &reqwest::Client,
    target: &str,
    request: TunneledRequest,
) -> Result<TunneledResponse> {
    let url = target_url(target, &request.path, &request.query);
    let method = reqwest::Method::from_bytes(request.method.as_bytes())?;

    let mut builder = client.request(method, url);
    for (name, value) in &request.header {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.body(request.body).send().await?;
    let status_code = response.status().as_u16();
    let header = fold_headers(
        response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let body = response.bytes().await?.to_vec();

    Ok(TunneledResponse {
        request_id: request.request_id,
        status_code,
        header,
        body,
    })
}
