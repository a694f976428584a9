//! Shared end-to-end test harness: a self-signed TLS identity, a scriptable fake controller
//! speaking the same JSON-RPC framing the proxy expects, and a plain-TCP client-facing server
//! wired up exactly like [`jimm_gateway::http::make_router`] expects.
//!
//! The client-facing hop is tested over plain TCP rather than TLS: [`jimm_gateway::listener`]
//! owns TLS termination and is exercised on its own, while these tests are about the proxy
//! engine's wire behavior, which doesn't care which transport carried the bytes in.
//! Everything downstream of the Dialer, though, is real TLS over a real loopback socket,
//! because that's the boundary [`jimm_gateway::dialer::Dialer`] actually dials.

use futures_util::{SinkExt, StreamExt};
use jimm_gateway::message::Message;
use jimm_gateway::services::{CandidateAddress, ControllerRecord};
use rcgen::CertifiedKey;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// A self-signed certificate/key pair for `localhost`, plus the PEM clients should trust.
pub struct SelfSignedIdentity {
    pub ca_certificate_pem: String,
    server_config: Arc<ServerConfig>,
}

pub fn self_signed_identity() -> SelfSignedIdentity {
    let CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(["localhost".to_owned()]).expect("self-signed cert generation");

    let cert_pem = cert.pem();
    let key_pem = signing_key.serialize_pem();

    let certificate = CertificateDer::from(cert.der().to_vec());
    let private_key = PrivateKeyDer::try_from(rustls_pemfile::private_key(&mut key_pem.as_bytes()).unwrap().unwrap()).unwrap();

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certificate], private_key)
        .expect("valid self-signed server config");

    SelfSignedIdentity {
        ca_certificate_pem: cert_pem,
        server_config: Arc::new(server_config),
    }
}

/// A single turn of scripted controller behavior: given one decoded incoming message, produce
/// zero or more messages to write back.
pub type ControllerStep = Box<dyn FnMut(Message) -> Vec<Message> + Send>;

/// Bind a fake controller on an ephemeral loopback port, serving TLS with `identity` and
/// running `script` against every message the (single) client connection sends. Returns the
/// `ControllerRecord` a [`jimm_gateway::dialer::Dialer`] can reach it through.
pub async fn spawn_fake_controller(identity: &SelfSignedIdentity, mut script: Vec<ControllerStep>) -> ControllerRecord {
    let port = portpicker::pick_unused_port().expect("find an unused loopback port");
    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind fake controller");
    let local_addr = listener.local_addr().expect("local addr");
    let acceptor = TlsAcceptor::from(Arc::clone(&identity.server_config));

    tokio::spawn(async move {
        let Ok((tcp, _peer)) = listener.accept().await else { return };
        let Ok(tls) = acceptor.accept(tcp).await else { return };
        let Ok(ws) = tokio_tungstenite::accept_async(tls).await else { return };
        let (mut sink, mut stream) = ws.split();

        while let Some(Ok(WsMessage::Text(text))) = stream.next().await {
            let Ok(message) = serde_json::from_str::<Message>(text.as_str()) else { continue };

            let responses = if script.is_empty() { Vec::new() } else { script.remove(0)(message) };

            for response in responses {
                let text = serde_json::to_string(&response).expect("serialize scripted response");
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    return;
                }
            }
        }
    });

    ControllerRecord {
        ca_certificate: identity.ca_certificate_pem.clone(),
        tls_hostname: "localhost".to_owned(),
        public_address: None,
        addresses: vec![CandidateAddress {
            host_port: local_addr.to_string(),
            scope: jimm_gateway::services::AddressScope::parse("public"),
        }],
    }
}

/// A controller step that always replies with a canned success `Response` for any request.
pub fn respond_with(response: serde_json::Value) -> ControllerStep {
    Box::new(move |incoming| vec![Message::success_response(incoming.request_id, response.clone())])
}
