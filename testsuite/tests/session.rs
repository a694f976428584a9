//! Drives a whole client session through the real router: client-credentials login, an
//! ordinary RPC round trip with the `servers` key stripped, and the permission-retry
//! procedure, all against a scripted fake controller.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use jimm_gateway::audit::{AuditSink, VecAuditSink};
use jimm_gateway::dev_services::{DevLoginService, DevTokenGenerator};
use jimm_gateway::http::{make_router, AppState};
use jimm_gateway::services::{ControllerDirectory, ControllerRecord, ResolvedController};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Resolves every model tag to the same single fake controller, sidestepping the need for a
/// full `Conf`/`StaticControllerDirectory` in these tests.
struct SingleControllerDirectory(ControllerRecord);

#[async_trait]
impl ControllerDirectory for SingleControllerDirectory {
    async fn resolve(&self, model_tag: Option<&str>) -> anyhow::Result<ResolvedController> {
        Ok(ResolvedController {
            record: self.0.clone(),
            model_name: model_tag.map(str::to_owned),
            controller_uuid: "test-controller".to_owned(),
        })
    }
}

async fn recv_json(client: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin)) -> serde_json::Value {
    loop {
        match client.next().await.expect("client socket closed early").expect("client read error") {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).expect("valid JSON frame"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn login_then_rpc_strips_servers_key_and_handles_permission_retry() {
    let identity = testsuite::self_signed_identity();

    let script: Vec<testsuite::ControllerStep> = vec![
        // 1. the rewritten controller-bound Login JIMM builds out of LoginWithClientCredentials
        Box::new(|login| vec![jimm_gateway::message::Message::success_response(login.request_id, json!({}))]),
        // 2. an ordinary RPC request; the controller's reply carries a `servers` key the proxy
        //    must strip before it reaches the client
        Box::new(|request| {
            vec![jimm_gateway::message::Message::success_response(
                request.request_id,
                json!({"servers": [["host:17070"]], "models": []}),
            )]
        }),
        // 3. a second RPC request the controller rejects as needing an upgraded permission
        Box::new(|request| {
            vec![jimm_gateway::message::Message {
                request_id: request.request_id,
                error: Some("higher permission required".to_owned()),
                error_code: Some("access required".to_owned()),
                error_info: Some(std::collections::HashMap::from([("some-model-uuid".to_owned(), json!("superuser"))])),
                ..Default::default()
            }]
        }),
        // 4. the upgraded Login JIMM resends as part of the retry procedure
        Box::new(|login| vec![jimm_gateway::message::Message::success_response(login.request_id, json!({}))]),
        // 5. the original request #3, resent after the upgraded Login
        Box::new(|request| vec![jimm_gateway::message::Message::success_response(request.request_id, json!({"ok": true}))]),
    ];

    let record = testsuite::spawn_fake_controller(&identity, script).await;

    let audit_sink = Arc::new(VecAuditSink::new());
    let state = AppState {
        conf: Arc::new(jimm_gateway::config::Conf {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            tls_certificate_file: None,
            tls_private_key_file: None,
            log_file: camino::Utf8PathBuf::from("/tmp/jimm-gateway-test.log"),
            log_filter: "info".to_owned(),
            facade_path_segment: "api".to_owned(),
            controllers: std::collections::HashMap::new(),
        }),
        login_service: Arc::new(DevLoginService),
        token_generator: Arc::new(DevTokenGenerator),
        controller_directory: Arc::new(SingleControllerDirectory(record)),
        audit_sink: Arc::clone(&audit_sink) as Arc<dyn AuditSink>,
    };

    let router = make_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind client-facing listener");
    let local_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.ok();
    });

    let (mut client, _response) = tokio_tungstenite::connect_async(format!("ws://{local_addr}/api")).await.expect("client connect");

    // LoginWithClientCredentials: intercepted by Admin, rewritten into a controller Login.
    let login_request = json!({
        "request-id": 1,
        "type": "Admin",
        "version": 4,
        "request": "LoginWithClientCredentials",
        "params": {"client-id": "cid", "client-secret": "csec"},
    });
    client.send(WsMessage::Text(login_request.to_string().into())).await.unwrap();
    let login_response = recv_json(&mut client).await;
    assert_eq!(login_response["request-id"], 1);
    assert!(login_response.get("error").is_none());

    // An ordinary RPC request; the response's `servers` key must be stripped.
    let status_request = json!({
        "request-id": 2,
        "type": "Client",
        "version": 6,
        "request": "FullStatus",
        "params": {},
    });
    client.send(WsMessage::Text(status_request.to_string().into())).await.unwrap();
    let status_response = recv_json(&mut client).await;
    assert_eq!(status_response["request-id"], 2);
    assert!(status_response["response"].get("servers").is_none());
    assert_eq!(status_response["response"]["models"], json!([]));

    // A request that triggers permission retry. The client should only ever see the final
    // success, never the intermediate `access required` error.
    let grant_request = json!({
        "request-id": 3,
        "type": "Client",
        "version": 6,
        "request": "GrantModelAccess",
        "params": {},
    });
    client.send(WsMessage::Text(grant_request.to_string().into())).await.unwrap();
    let grant_response = recv_json(&mut client).await;
    assert_eq!(grant_response["request-id"], 3);
    assert!(grant_response.get("error").is_none());
    assert_eq!(grant_response["response"], json!({"ok": true}));

    let records = audit_sink.snapshot();
    assert!(records.iter().any(|r| r.request_id == 2 && !r.is_response));
    assert!(records.iter().any(|r| r.request_id == 2 && r.is_response));
}
