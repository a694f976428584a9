//! §4.1 Dialer: open a TLS WebSocket to a controller, racing multiple candidate addresses.

use crate::error::JimmError;
use crate::services::ControllerRecord;
use crate::tls;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::WebSocketStream;
use url::Url;

/// Wrap a single candidate's dial attempt so a hung TCP/TLS/WS handshake can't stall the
/// whole race (or the sequential public-address attempt) forever.
async fn dial_one_with_timeout(
    host_port: &str,
    record: &ControllerRecord,
    options: &DialOptions,
    connector: tokio_rustls::TlsConnector,
) -> Result<ControllerSocket, JimmError> {
    match tokio::time::timeout(DIAL_TIMEOUT, dial_one(host_port, record, options, connector)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(JimmError::connection_failed(
            "dialer.dial_one",
            anyhow::anyhow!("dial to {host_port} timed out after {DIAL_TIMEOUT:?}"),
        )),
    }
}

pub type ControllerSocket = WebSocketStream<TlsStream<TcpStream>>;

/// How long a single candidate address gets before it's considered a loser in the race.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default, Clone)]
pub struct DialOptions {
    /// Model UUID; when set the path becomes `/model/<uuid>/<final_segment>`.
    pub model_tag: Option<String>,
    /// Final URL path segment, default `api`.
    pub final_segment: Option<String>,
    pub headers: Vec<(String, String)>,
}

pub struct Dialer;

impl Dialer {
    /// Dial `record` per §4.1: try `public_address` alone first when set, and only fall back
    /// to racing the filtered `addresses` list if there's no public address or it fails.
    pub async fn dial(record: &ControllerRecord, options: &DialOptions) -> Result<ControllerSocket, JimmError> {
        let connector = tls::build_connector(&record.ca_certificate)
            .map_err(|e| JimmError::connection_failed("dialer.dial", e))?;

        let mut public_error = None;
        if let Some(public_address) = &record.public_address {
            match dial_one_with_timeout(public_address, record, options, connector.clone()).await {
                Ok(socket) => return Ok(socket),
                Err(error) => public_error = Some(error),
            }
        }

        let fallback_candidates = record.fallback_candidates();

        if fallback_candidates.is_empty() {
            return Err(public_error.unwrap_or_else(|| JimmError::bad_request("dialer.dial", "no dialable addresses for controller")));
        }

        if fallback_candidates.len() == 1 {
            return dial_one_with_timeout(&fallback_candidates[0], record, options, connector).await;
        }

        race(fallback_candidates, record.clone(), options.clone(), connector).await
    }
}

async fn race(
    candidates: Vec<String>,
    record: ControllerRecord,
    options: DialOptions,
    connector: tokio_rustls::TlsConnector,
) -> Result<ControllerSocket, JimmError> {
    let (winner_tx, mut winner_rx) = tokio::sync::mpsc::channel::<Result<ControllerSocket, JimmError>>(candidates.len());
    let mut racers = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let record = record.clone();
        let options = options.clone();
        let connector = connector.clone();
        let winner_tx = winner_tx.clone();

        // ChildTask aborts on drop, which is exactly the cancellation signal a losing
        // racer needs; dropping `racers` below stops every still-running dial at once.
        racers.push(jimm_gateway_task::ChildTask::spawn(async move {
            let result = dial_one_with_timeout(&candidate, &record, &options, connector).await;
            let _ = winner_tx.send(result).await;
        }));
    }
    drop(winner_tx);

    let mut last_error = None;

    while let Some(result) = winner_rx.recv().await {
        match result {
            Ok(socket) => {
                // Dropping the remaining racers aborts them; any socket a loser already
                // established is closed when its task unwinds.
                drop(racers);
                return Ok(socket);
            }
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| JimmError::bad_request("dialer.race", "no candidate addresses")))
}

async fn dial_one(
    host_port: &str,
    record: &ControllerRecord,
    options: &DialOptions,
    connector: tokio_rustls::TlsConnector,
) -> Result<ControllerSocket, JimmError> {
    let url = build_url(host_port, options).map_err(|e| JimmError::server_configuration("dialer.dial_one", e.to_string()))?;

    let tcp = TcpStream::connect(host_port)
        .await
        .map_err(|e| JimmError::connection_failed("dialer.dial_one", e))?;
    tcp.set_nodelay(true).ok();

    let server_name = tls::server_name(&record.tls_hostname).map_err(|e| JimmError::connection_failed("dialer.dial_one", e))?;

    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| JimmError::connection_failed("dialer.dial_one", e))?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| JimmError::server_configuration("dialer.dial_one", e.to_string()))?;

    for (name, value) in &options.headers {
        let value = HeaderValue::from_str(value).map_err(|e| JimmError::server_configuration("dialer.dial_one", e.to_string()))?;
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| JimmError::server_configuration("dialer.dial_one", e.to_string()))?,
            value,
        );
    }

    let (socket, _response) = tokio_tungstenite::client_async(request, tls_stream)
        .await
        .map_err(|e| JimmError::connection_failed("dialer.dial_one", e))?;

    Ok(socket)
}

fn build_url(host_port: &str, options: &DialOptions) -> Result<Url, url::ParseError> {
    let final_segment = options.final_segment.as_deref().unwrap_or("api");
    let path = match &options.model_tag {
        Some(model) => format!("/model/{model}/{final_segment}"),
        None => format!("/{final_segment}"),
    };
    Url::parse(&format!("wss://{host_port}{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{AddressScope, CandidateAddress};

    fn record(public: Option<&str>, addrs: &[(&str, &str)]) -> ControllerRecord {
        ControllerRecord {
            ca_certificate: String::new(),
            tls_hostname: "controller.example".to_owned(),
            public_address: public.map(str::to_owned),
            addresses: addrs
                .iter()
                .map(|(host, scope)| CandidateAddress {
                    host_port: (*host).to_owned(),
                    scope: AddressScope::parse(scope),
                })
                .collect(),
        }
    }

    #[test]
    fn candidate_filtering_and_ordering() {
        let rec = record(
            None,
            &[
                ("a:17070", "cloud-local"),
                ("b:17070", "public"),
                ("c:17070", "machine-local"),
            ],
        );
        assert_eq!(rec.dial_candidates(), vec!["a:17070".to_owned(), "b:17070".to_owned()]);
    }

    #[test]
    fn public_address_dialed_first() {
        let rec = record(Some("pub:17070"), &[("a:17070", "public")]);
        assert_eq!(rec.dial_candidates(), vec!["pub:17070".to_owned(), "a:17070".to_owned()]);
    }

    #[test]
    fn url_construction_with_model_tag() {
        let options = DialOptions {
            model_tag: Some("deadbeef".to_owned()),
            ..Default::default()
        };
        let url = build_url("host:1234", &options).unwrap();
        assert_eq!(url.as_str(), "wss://host:1234/model/deadbeef/api");
    }

    #[test]
    fn url_construction_without_model_tag() {
        let url = build_url("host:1234", &DialOptions::default()).unwrap();
        assert_eq!(url.as_str(), "wss://host:1234/api");
    }
}
