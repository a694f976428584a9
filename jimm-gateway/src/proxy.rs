//! §4.3 Proxy Engine — the two cooperating pumps that move RPC traffic between a client and
//! the controller it's been routed to, plus everything the session needs to stay coherent
//! while that's happening: the in-flight table, the Admin interceptor, the permission-retry
//! procedure, and the audit side channel.

use crate::admin::{self, AdminOutcome, AdminSessionState};
use crate::audit::{AuditContext, AuditHandle, AuditRecord, AuditSink};
use crate::dialer::{Dialer, DialOptions};
use crate::error::JimmError;
use crate::inflight::InFlightTable;
use crate::message::{LoginRequest, Message};
use crate::retry;
use crate::services::{ControllerDirectory, DeviceAuthResponse, LoginService, TokenGenerator, UserTag};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jimm_gateway_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio_tungstenite::tungstenite::Message as ControllerMessage;

type ClientSink = SplitSink<WebSocket, WsMessage>;
type ClientStream = SplitStream<WebSocket>;
type ControllerSink = SplitSink<crate::dialer::ControllerSocket, ControllerMessage>;
type ControllerStream = SplitStream<crate::dialer::ControllerSocket>;

/// Collaborators a session needs, handed in by the host binary's server wiring.
pub struct SessionDeps {
    pub login_service: Arc<dyn LoginService>,
    pub token_generator: Arc<dyn TokenGenerator>,
    pub controller_directory: Arc<dyn ControllerDirectory>,
    pub audit_sink: Arc<dyn AuditSink>,
    /// The model UUID carried by the client's URL, if the client dialed `/model/:uuid/api`
    /// rather than the bare controller-only path.
    pub model_tag: Option<String>,
}

/// Drive one client WebSocket connection end to end. Returns once both pumps have exited.
pub async fn run_session(socket: WebSocket, deps: SessionDeps) {
    let (client_sink, client_stream) = socket.split();
    let (audit, audit_drain) = AuditHandle::new(deps.audit_sink);
    let (shutdown, shutdown_signal) = ShutdownHandle::new();

    let shared = Arc::new(SessionShared {
        conversation_id: new_conversation_id(),
        inflight: InFlightTable::new(),
        client_writer: ClientWriter::new(client_sink),
        controller_cell: OnceCell::new(),
        user_tag: parking_lot::Mutex::new(None),
        model_name: parking_lot::Mutex::new(None),
        device_auth: parking_lot::Mutex::new(None),
        audit,
        login_service: deps.login_service,
        token_generator: deps.token_generator,
        controller_directory: deps.controller_directory,
        model_tag: deps.model_tag,
        shutdown,
        shutdown_signal: shutdown_signal.clone(),
    });

    let drain_task = jimm_gateway_task::spawn_task(audit_drain, shutdown_signal.clone());

    client_to_controller_pump(Arc::clone(&shared), client_stream, shutdown_signal).await;
    shared.shutdown.signal();

    if let Some(controller) = shared.controller_cell.get() {
        let pump = controller.pump.lock().await.take();
        if let Some(pump) = pump {
            let _ = pump.join().await;
        }
    }

    let _ = drain_task.join().await;
}

fn new_conversation_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct SessionShared {
    conversation_id: String,
    inflight: InFlightTable,
    client_writer: ClientWriter,
    controller_cell: OnceCell<Arc<ControllerHandle>>,
    user_tag: parking_lot::Mutex<Option<UserTag>>,
    model_name: parking_lot::Mutex<Option<String>>,
    device_auth: parking_lot::Mutex<Option<DeviceAuthResponse>>,
    audit: AuditHandle,
    login_service: Arc<dyn LoginService>,
    token_generator: Arc<dyn TokenGenerator>,
    controller_directory: Arc<dyn ControllerDirectory>,
    model_tag: Option<String>,
    shutdown: ShutdownHandle,
    /// Kept around so late dials (in `ensure_controller`) can still hand a fresh receiver to
    /// the controller pump they spawn; `ShutdownHandle` itself only exposes the sending half.
    shutdown_signal: ShutdownSignal,
}

/// The live controller connection, once dialed. Held behind `controller_cell`'s `OnceCell` so
/// the dial happens exactly once per session.
struct ControllerHandle {
    writer: ControllerWriter,
    /// The controller→client pump, owned here so the session can join it on the way out.
    pump: AsyncMutex<Option<ChildTask<()>>>,
}

struct ClientWriter {
    sink: AsyncMutex<ClientSink>,
}

impl ClientWriter {
    fn new(sink: ClientSink) -> Self {
        Self { sink: AsyncMutex::new(sink) }
    }

    async fn send(&self, message: &Message) -> Result<(), JimmError> {
        let text = serde_json::to_string(message).map_err(|e| JimmError::other("proxy.client_write", e))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| JimmError::connection_failed("proxy.client_write", e))
    }
}

struct ControllerWriter {
    sink: AsyncMutex<ControllerSink>,
}

impl ControllerWriter {
    fn new(sink: ControllerSink) -> Self {
        Self { sink: AsyncMutex::new(sink) }
    }

    async fn send(&self, message: &Message) -> Result<(), JimmError> {
        let text = serde_json::to_string(message).map_err(|e| JimmError::other("proxy.controller_write", e))?;
        self.sink
            .lock()
            .await
            .send(ControllerMessage::Text(text.into()))
            .await
            .map_err(|e| JimmError::connection_failed("proxy.controller_write", e))
    }

    /// Write both messages while holding the write lock once, so nothing can interleave
    /// between the upgraded Login and the pending request it's meant to unblock (§4.5).
    async fn send_two(&self, first: &Message, second: &Message) -> Result<(), JimmError> {
        let first_text = serde_json::to_string(first).map_err(|e| JimmError::other("proxy.controller_write", e))?;
        let second_text = serde_json::to_string(second).map_err(|e| JimmError::other("proxy.controller_write", e))?;

        let mut sink = self.sink.lock().await;
        sink.send(ControllerMessage::Text(first_text.into()))
            .await
            .map_err(|e| JimmError::connection_failed("proxy.controller_write", e))?;
        sink.send(ControllerMessage::Text(second_text.into()))
            .await
            .map_err(|e| JimmError::connection_failed("proxy.controller_write", e))
    }
}

/// Run `f` with an [`AuditContext`] borrowed from the session's current user/model state.
fn with_audit_context<R>(shared: &SessionShared, f: impl FnOnce(&AuditContext<'_>) -> R) -> R {
    let user_tag = shared.user_tag.lock();
    let model_name = shared.model_name.lock();
    let ctx = AuditContext {
        conversation_id: &shared.conversation_id,
        user_tag: user_tag.as_ref().map(|u| u.0.as_str()),
        model_name: model_name.as_deref(),
    };
    f(&ctx)
}

/// Resolve and dial the controller exactly once per session; subsequent calls return the
/// cached handle (§4.3 step 1).
async fn ensure_controller(shared: &Arc<SessionShared>) -> Result<Arc<ControllerHandle>, JimmError> {
    let handle = shared
        .controller_cell
        .get_or_try_init(|| async {
            let resolved = shared
                .controller_directory
                .resolve(shared.model_tag.as_deref())
                .await
                .map_err(|e| JimmError::other("proxy.ensure_controller", e))?;

            *shared.model_name.lock() = resolved.model_name.clone();

            let options = DialOptions {
                model_tag: Some(resolved.controller_uuid.clone()),
                ..Default::default()
            };

            let socket = Dialer::dial(&resolved.record, &options).await?;
            let (sink, stream) = socket.split();

            let handle = Arc::new(ControllerHandle {
                writer: ControllerWriter::new(sink),
                pump: AsyncMutex::new(None),
            });

            let pump_shared = Arc::clone(shared);
            let pump_handle = Arc::clone(&handle);
            let shutdown_signal = shared.shutdown_signal.clone();
            let pump_task = ChildTask::spawn(async move {
                controller_to_client_pump(pump_shared, stream, shutdown_signal, pump_handle).await;
            });
            *handle.pump.lock().await = Some(pump_task);

            Ok::<_, JimmError>(handle)
        })
        .await?;

    Ok(Arc::clone(handle))
}

/// Client→Controller pump (§4.3). Owns the single reader on the client socket.
async fn client_to_controller_pump(shared: Arc<SessionShared>, mut stream: ClientStream, mut shutdown_signal: ShutdownSignal) {
    loop {
        let incoming = tokio::select! {
            incoming = stream.next() => incoming,
            () = shutdown_signal.wait() => break,
        };

        let Some(incoming) = incoming else { break };

        let text = match incoming {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                warn!(%error, "client socket read failed");
                break;
            }
        };

        let message: Message = match serde_json::from_str(text.as_str()) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "malformed client message, dropping frame");
                continue;
            }
        };

        if let Err(error) = handle_client_message(&shared, message).await {
            debug!(%error, "client pump ending session");
            break;
        }
    }

    shared.shutdown.signal();
}

async fn handle_client_message(shared: &Arc<SessionShared>, message: Message) -> Result<(), JimmError> {
    let controller = match ensure_controller(shared).await {
        Ok(controller) => controller,
        Err(error) => {
            let response = Message::error_response(message.request_id, error.rpc_error_code(), error.rpc_message());
            let _ = shared.client_writer.send(&response).await;
            return Err(error);
        }
    };

    let record = with_audit_context(shared, |ctx| AuditRecord::for_request(ctx, &message));
    shared.audit.push(record);

    if message.is_admin_facade() {
        match run_admin_interceptor(shared, &message).await {
            AdminOutcome::Respond(response) => shared.client_writer.send(&response).await,
            AdminOutcome::ForwardAsLogin { message: login_message, user } => {
                *shared.user_tag.lock() = Some(user);
                forward_to_controller(shared, &controller, login_message.clone()).await?;
                shared.inflight.set_last_login(login_message);
                Ok(())
            }
            AdminOutcome::PassThrough => forward_to_controller(shared, &controller, message).await,
            AdminOutcome::Fail(error) => {
                let response = Message::error_response(message.request_id, error.rpc_error_code(), error.rpc_message());
                shared.client_writer.send(&response).await
            }
        }
    } else {
        forward_to_controller(shared, &controller, message).await
    }
}

async fn run_admin_interceptor(shared: &Arc<SessionShared>, message: &Message) -> AdminOutcome {
    let mut device_auth = shared.device_auth.lock().clone();
    let mut authenticated_user = shared.user_tag.lock().clone();

    let mut state = AdminSessionState {
        device_auth: &mut device_auth,
        authenticated_user: &mut authenticated_user,
    };

    let outcome = admin::handle(shared.login_service.as_ref(), shared.token_generator.as_ref(), &mut state, message).await;

    *shared.device_auth.lock() = device_auth;
    *shared.user_tag.lock() = authenticated_user;

    outcome
}

/// Forward `message` to the controller unchanged, tracking it in the in-flight table (§4.3
/// step 4/5).
async fn forward_to_controller(shared: &Arc<SessionShared>, controller: &ControllerHandle, message: Message) -> Result<(), JimmError> {
    let request_id = message.request_id;
    shared.inflight.insert(message.clone());

    if let Err(error) = controller.writer.send(&message).await {
        shared.inflight.remove(request_id);
        let response = Message::error_response(request_id, error.rpc_error_code(), error.rpc_message());
        let _ = shared.client_writer.send(&response).await;
        return Err(error);
    }

    Ok(())
}

/// Controller→Client pump (§4.3). Owns the single reader on the controller socket.
async fn controller_to_client_pump(
    shared: Arc<SessionShared>,
    mut stream: ControllerStream,
    mut shutdown_signal: ShutdownSignal,
    controller: Arc<ControllerHandle>,
) {
    loop {
        let incoming = tokio::select! {
            incoming = stream.next() => incoming,
            () = shutdown_signal.wait() => break,
        };

        let Some(incoming) = incoming else { break };

        let text = match incoming {
            Ok(ControllerMessage::Text(text)) => text,
            Ok(ControllerMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                warn!(%error, "controller socket read failed");
                break;
            }
        };

        let response: Message = match serde_json::from_str(text.as_str()) {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "malformed controller message, dropping frame");
                continue;
            }
        };

        if let Err(error) = handle_controller_message(&shared, &controller, response).await {
            debug!(%error, "controller pump ending session");
            break;
        }
    }

    shared.shutdown.signal();
}

async fn handle_controller_message(shared: &Arc<SessionShared>, controller: &ControllerHandle, response: Message) -> Result<(), JimmError> {
    if let Some(permissions) = retry::required_permissions(&response) {
        return run_permission_retry(shared, controller, &response, permissions).await;
    }

    let rewritten = strip_servers_key(response)?;

    let request = shared.inflight.remove(rewritten.request_id);
    let record = with_audit_context(shared, |ctx| AuditRecord::for_response(ctx, request.as_ref(), &rewritten));
    shared.audit.push(record);

    shared.client_writer.send(&rewritten).await
}

/// Drop the top-level `servers` key from a response's `Response` object (§4.3 step 2). A
/// non-object `Response` is a protocol violation and fatal to the session; a missing one
/// (pure error responses) passes through untouched.
fn strip_servers_key(mut message: Message) -> Result<Message, JimmError> {
    if let Some(response) = message.response.take() {
        match response {
            serde_json::Value::Object(mut object) => {
                object.remove("servers");
                message.response = Some(serde_json::Value::Object(object));
            }
            other => {
                message.response = Some(other);
                return Err(JimmError::bad_request("proxy.strip_servers_key", "controller response was not a JSON object"));
            }
        }
    }
    Ok(message)
}

/// Run the permission-retry procedure (§4.5). On failure, the *original* pending request is
/// failed back to the client; the controller socket is left in whatever state the write
/// attempt left it in, and session termination follows from the propagated error.
async fn run_permission_retry(
    shared: &Arc<SessionShared>,
    controller: &ControllerHandle,
    response: &Message,
    permissions: HashMap<String, String>,
) -> Result<(), JimmError> {
    if let Err(error) = retry_once(shared, controller, response, &permissions).await {
        let request_id = response.request_id;
        shared.inflight.remove(request_id);
        let failure = Message::error_response(request_id, error.rpc_error_code(), error.rpc_message());
        let _ = shared.client_writer.send(&failure).await;
        return Err(error);
    }

    Ok(())
}

async fn retry_once(
    shared: &Arc<SessionShared>,
    controller: &ControllerHandle,
    response: &Message,
    permissions: &HashMap<String, String>,
) -> Result<(), JimmError> {
    let Some(last_login) = shared.inflight.last_login() else {
        return Err(JimmError::unauthorized("proxy.permission_retry"));
    };

    let pending = shared
        .inflight
        .peek(response.request_id)
        .ok_or_else(|| JimmError::bad_request("proxy.permission_retry", "no pending request for retried response"))?;

    let upgraded_jwt = shared
        .token_generator
        .make_token(permissions)
        .await
        .map_err(|e| JimmError::other("proxy.permission_retry", e))?;

    let login_params = last_login
        .params
        .clone()
        .ok_or_else(|| JimmError::bad_request("proxy.permission_retry", "stashed login had no params"))?;
    let mut login_params: LoginRequest =
        serde_json::from_value(login_params).map_err(|e| JimmError::other("proxy.permission_retry", e))?;
    login_params.token = base64::engine::general_purpose::STANDARD.encode(upgraded_jwt);

    let mut new_login = last_login;
    new_login.params = Some(serde_json::to_value(&login_params).map_err(|e| JimmError::other("proxy.permission_retry", e))?);

    controller.writer.send_two(&new_login, &pending).await?;
    shared.inflight.set_last_login(new_login);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_id_is_sixteen_lowercase_hex_chars() {
        let id = new_conversation_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn strip_servers_key_removes_servers_and_keeps_rest() {
        let message = Message {
            request_id: 1,
            response: Some(json!({"servers": [["host:1"]], "models": []})),
            ..Default::default()
        };
        let rewritten = strip_servers_key(message).unwrap();
        let response = rewritten.response.unwrap();
        assert!(response.get("servers").is_none());
        assert_eq!(response["models"], json!([]));
    }

    #[test]
    fn strip_servers_key_passes_through_missing_response() {
        let message = Message {
            request_id: 1,
            error: Some("boom".to_owned()),
            error_code: Some("some-code".to_owned()),
            ..Default::default()
        };
        let rewritten = strip_servers_key(message).unwrap();
        assert!(rewritten.response.is_none());
    }

    #[test]
    fn strip_servers_key_rejects_non_object_response() {
        let message = Message {
            request_id: 1,
            response: Some(json!([1, 2, 3])),
            ..Default::default()
        };
        assert!(strip_servers_key(message).is_err());
    }
}
