//! §4.2 RPC Client — the standalone request/response path used to originate JIMM-to-controller
//! calls outside of a proxied client session (e.g. administrative operations the host binary
//! needs to perform against a controller directly).

use crate::dialer::ControllerSocket;
use crate::error::JimmError;
use crate::message::Message;
use crate::retry;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jimm_gateway_task::ChildTask;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message as WireMessage;

type Sink = SplitSink<ControllerSocket, WireMessage>;
type Stream = SplitStream<ControllerSocket>;
type Waiters = parking_lot::Mutex<HashMap<u64, oneshot::Sender<Message>>>;

/// A thin JSON-RPC client over an already-dialed controller WebSocket. A background task
/// drains responses and dispatches them by `RequestID` to whichever `call` is waiting.
pub struct RpcClient {
    writer: Arc<AsyncMutex<Sink>>,
    next_request_id: AtomicU64,
    waiters: Arc<Waiters>,
    reader: AsyncMutex<Option<ChildTask<()>>>,
}

impl RpcClient {
    pub fn new(socket: ControllerSocket) -> Self {
        let (sink, stream) = socket.split();
        let writer = Arc::new(AsyncMutex::new(sink));
        let waiters: Arc<Waiters> = Arc::new(parking_lot::Mutex::new(HashMap::new()));

        let reader = ChildTask::spawn(read_loop(stream, Arc::clone(&writer), Arc::clone(&waiters)));

        Self {
            writer,
            next_request_id: AtomicU64::new(1),
            waiters,
            reader: AsyncMutex::new(Some(reader)),
        }
    }

    /// Marshal `args`, assign the next monotonic `RequestID`, write the request, and wait
    /// for the matching response.
    pub async fn call<P, R>(&self, facade: &str, version: u32, id: Option<&str>, method: &str, args: &P) -> Result<R, JimmError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let params = serde_json::to_value(args).map_err(|e| JimmError::other("rpc_client.call", e))?;

        let message = Message {
            request_id,
            facade_type: Some(facade.to_owned()),
            version: Some(version),
            id: id.map(str::to_owned),
            request: Some(method.to_owned()),
            params: Some(params),
            ..Default::default()
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);

        if let Err(error) = self.send(&message).await {
            self.waiters.lock().remove(&request_id);
            return Err(error);
        }

        let response = rx
            .await
            .map_err(|_| JimmError::connection_failed("rpc_client.call", anyhow::anyhow!("rpc connection dropped before a response arrived")))?;

        decode_response(response)
    }

    async fn send(&self, message: &Message) -> Result<(), JimmError> {
        let text = serde_json::to_string(message).map_err(|e| JimmError::other("rpc_client.send", e))?;
        self.writer
            .lock()
            .await
            .send(WireMessage::Text(text.into()))
            .await
            .map_err(|e| JimmError::connection_failed("rpc_client.send", e))
    }

    /// Send a normal close frame. Outstanding calls complete as the server drains them; if
    /// writing the close itself fails the socket is already gone and is dropped abruptly.
    pub async fn close(self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(WireMessage::Close(None)).await;
        }

        if let Some(reader) = self.reader.lock().await.take() {
            let _ = reader.join().await;
        }
    }
}

fn decode_response<R: DeserializeOwned>(response: Message) -> Result<R, JimmError> {
    if let Some(permissions) = retry::required_permissions(&response) {
        return Err(JimmError::permission_check_required("rpc_client.call", permissions));
    }

    if let Some(code) = &response.error_code {
        return Err(JimmError::other(
            "rpc_client.call",
            anyhow::anyhow!("{code}: {}", response.error.clone().unwrap_or_default()),
        ));
    }

    let value = response.response.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| JimmError::other("rpc_client.call", e))
}

async fn read_loop(mut stream: Stream, writer: Arc<AsyncMutex<Sink>>, waiters: Arc<Waiters>) {
    while let Some(incoming) = stream.next().await {
        let text = match incoming {
            Ok(WireMessage::Text(text)) => text,
            Ok(WireMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                warn!(%error, "rpc client socket read failed");
                break;
            }
        };

        let message: Message = match serde_json::from_str(text.as_str()) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "malformed rpc client message, dropping frame");
                continue;
            }
        };

        if message.request_id == 0 {
            warn!("rpc client received a request-id of zero, closing connection");
            break;
        }

        if message.is_request() {
            respond_not_implemented(&writer, &message).await;
            continue;
        }

        if let Some(waiter) = waiters.lock().remove(&message.request_id) {
            let _ = waiter.send(message);
        }
    }

    for (_, waiter) in waiters.lock().drain() {
        let _ = waiter.send(Message::error_response(0, "connection closed", "the rpc connection closed before a response arrived"));
    }
}

/// The Juju protocol is formally bidirectional but no controller ever issues server-to-client
/// requests; answer with a canned rejection and keep the connection alive.
async fn respond_not_implemented(writer: &Arc<AsyncMutex<Sink>>, message: &Message) {
    let not_implemented = Message::error_response(
        message.request_id,
        "not implemented",
        format!(
            "{}({}).{} not implemented",
            message.facade_type.as_deref().unwrap_or_default(),
            message.version.unwrap_or_default(),
            message.request.as_deref().unwrap_or_default(),
        ),
    );

    let Ok(text) = serde_json::to_string(&not_implemented) else {
        return;
    };

    let _ = writer.lock().await.send(WireMessage::Text(text.into())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_implemented_message_format() {
        let message = Message {
            request_id: 3,
            facade_type: Some("Client".to_owned()),
            version: Some(2),
            request: Some("FullStatus".to_owned()),
            ..Default::default()
        };
        let not_implemented = Message::error_response(message.request_id, "not implemented", "Client(2).FullStatus not implemented");
        assert_eq!(not_implemented.error.as_deref(), Some("Client(2).FullStatus not implemented"));
    }
}
