//! §4.6 HTTP Passthrough — non-RPC reverse-proxy paths (e.g. charm/resource upload and
//! download endpoints) that reuse the Dialer's TLS trust configuration but carry plain HTTP
//! request/response pairs instead of RPC frames.

use crate::services::ControllerRecord;
use crate::tls;

use anyhow::Context as _;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt as _; // into_data_stream
use std::time::Duration;

/// How long a single candidate gets to establish a connection and receive headers before
/// it's treated as a transport failure and the next candidate is tried.
const CANDIDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Forward `method path_and_query` to the first of `record`'s candidate addresses that
/// accepts the request, preserving method, headers, and body. Any response from a
/// controller — including error statuses such as 401 — is final and forwarded verbatim; only
/// a transport failure advances to the next candidate. Returns `504 Gateway Timeout` only if
/// every candidate fails at the transport level.
pub async fn forward(record: &ControllerRecord, method: Method, path_and_query: &str, headers: HeaderMap, body: Body) -> Response {
    let candidates = record.dial_candidates();

    if candidates.is_empty() {
        return gateway_timeout("no dialable addresses for controller");
    }

    let client = match build_client(record) {
        Ok(client) => client,
        Err(error) => return gateway_timeout(&error.to_string()),
    };

    // The body can only be consumed once; trying more than one candidate needs it buffered.
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => return gateway_timeout(&format!("failed to buffer request body: {error}")),
    };

    let mut last_error = None;

    for host_port in candidates {
        match try_candidate(&client, &host_port, &method, path_and_query, &headers, body_bytes.clone()).await {
            Ok(response) => return response,
            Err(error) => last_error = Some(error),
        }
    }

    gateway_timeout(&last_error.map(|e| e.to_string()).unwrap_or_else(|| "no candidate addresses".to_owned()))
}

async fn try_candidate(
    client: &reqwest::Client,
    host_port: &str,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> anyhow::Result<Response> {
    let url = format!("https://{host_port}{path_and_query}");

    let mut request = client.request(reqwest_method(method), &url);
    for (name, value) in headers.iter() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        request = request.header(name.clone(), value.clone());
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = request.send().await.context("transport error dialing controller")?;
    Ok(convert_response(response))
}

fn convert_response(response: reqwest::Response) -> Response {
    let response = axum::http::Response::from(response);
    let (parts, body) = response.into_parts();
    let body = Body::from_stream(body.into_data_stream());
    Response::from_parts(parts, body)
}

fn build_client(record: &ControllerRecord) -> anyhow::Result<reqwest::Client> {
    let client_config = tls::build_client_config(&record.ca_certificate)?;
    reqwest::Client::builder()
        .use_preconfigured_tls((*client_config).clone())
        .timeout(CANDIDATE_TIMEOUT)
        .build()
        .context("failed to build HTTP passthrough client")
}

fn reqwest_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}

fn gateway_timeout(message: &str) -> Response {
    (StatusCode::GATEWAY_TIMEOUT, message.to_owned()).into_response()
}
