//! §4.6 Stream Proxy — for streaming endpoints (e.g. a controller's debug-log socket) that
//! exchange JSON frames in both directions but don't follow the request/response RPC
//! protocol, so neither the in-flight table nor the Admin interceptor apply.

use crate::dialer::ControllerSocket;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jimm_gateway_task::ChildTask;
use tokio_tungstenite::tungstenite::Message as ControllerMessage;

/// Copy frames between `client` and `controller` in both directions until either side closes
/// or errors; the outer call returns once both copy tasks have stopped.
pub async fn relay(client: WebSocket, controller: ControllerSocket) {
    let (client_sink, client_stream) = client.split();
    let (controller_sink, controller_stream) = controller.split();

    let to_controller = ChildTask::spawn(pump_to_controller(client_stream, controller_sink));
    let to_client = ChildTask::spawn(pump_to_client(controller_stream, client_sink));

    // Whichever direction stops first wins the race; dropping the other task's `ChildTask`
    // (inside the losing `join()` future) aborts it, tearing down both sides together.
    tokio::select! {
        _ = to_controller.join() => {}
        _ = to_client.join() => {}
    }
}

async fn pump_to_controller(mut stream: SplitStream<WebSocket>, mut sink: SplitSink<ControllerSocket, ControllerMessage>) {
    while let Some(incoming) = stream.next().await {
        let frame = match incoming {
            Ok(ClientMessage::Text(text)) => ControllerMessage::Text(text.as_str().to_owned().into()),
            Ok(ClientMessage::Binary(data)) => ControllerMessage::Binary(data),
            Ok(ClientMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        if sink.send(frame).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
}

async fn pump_to_client(mut stream: SplitStream<ControllerSocket>, mut sink: SplitSink<WebSocket, ClientMessage>) {
    while let Some(incoming) = stream.next().await {
        let frame = match incoming {
            Ok(ControllerMessage::Text(text)) => ClientMessage::Text(text.as_str().to_owned().into()),
            Ok(ControllerMessage::Binary(data)) => ClientMessage::Binary(data),
            Ok(ControllerMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        if sink.send(frame).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
}
