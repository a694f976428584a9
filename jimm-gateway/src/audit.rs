//! §4.6 Audit side channel.
//!
//! Records are pushed onto an unbounded channel and drained by a background task, mirroring
//! the actor/handle pattern the teacher uses for its traffic-audit manager: a slow sink
//! never stalls a pump's hot path.

use crate::message::{Message, RequestId};
use jimm_gateway_task::{ShutdownSignal, Task};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// One `{error:{message, code, info}}` entry. Bulk responses are normalized to a list of
/// these even when there's only a single top-level error, so consumers see one shape.
#[derive(Debug, Clone, Serialize)]
pub struct AuditError {
    pub message: String,
    pub code: String,
    pub info: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Milliseconds since the epoch, UTC.
    pub timestamp_ms: i64,
    pub conversation_id: String,
    pub request_id: RequestId,
    pub user_tag: Option<String>,
    pub model_name: Option<String>,
    pub facade: Option<String>,
    pub method: Option<String>,
    pub version: Option<u32>,
    pub object_id: Option<String>,
    pub is_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<AuditError>,
}

pub struct AuditContext<'a> {
    pub conversation_id: &'a str,
    pub user_tag: Option<&'a str>,
    pub model_name: Option<&'a str>,
}

impl AuditRecord {
    pub fn for_request(ctx: &AuditContext<'_>, message: &Message) -> Self {
        Self {
            timestamp_ms: now_millis(),
            conversation_id: ctx.conversation_id.to_owned(),
            request_id: message.request_id,
            user_tag: ctx.user_tag.map(str::to_owned),
            model_name: ctx.model_name.map(str::to_owned),
            facade: message.facade_type.clone(),
            method: message.request.clone(),
            version: message.version,
            object_id: message.id.clone(),
            is_response: false,
            params: message.params.clone(),
            errors: Vec::new(),
        }
    }

    pub fn for_response(ctx: &AuditContext<'_>, request: Option<&Message>, response: &Message) -> Self {
        Self {
            timestamp_ms: now_millis(),
            conversation_id: ctx.conversation_id.to_owned(),
            request_id: response.request_id,
            user_tag: ctx.user_tag.map(str::to_owned),
            model_name: ctx.model_name.map(str::to_owned),
            facade: request.and_then(|r| r.facade_type.clone()),
            method: request.and_then(|r| r.request.clone()),
            version: request.and_then(|r| r.version),
            object_id: request.and_then(|r| r.id.clone()),
            is_response: true,
            params: None,
            errors: normalize_errors(response),
        }
    }
}

/// Normalize a response into a uniform list of `{error:{message, code, info}}`, whether it
/// carries a single top-level error or a bulk `results` list.
fn normalize_errors(response: &Message) -> Vec<AuditError> {
    let mut errors = Vec::new();

    if let Some(code) = &response.error_code {
        errors.push(AuditError {
            message: response.error.clone().unwrap_or_default(),
            code: code.clone(),
            info: response.error_info.clone().unwrap_or_default(),
        });
    }

    if let Some(Value::Object(obj)) = &response.response {
        if let Some(Value::Array(results)) = obj.get("results") {
            for result in results {
                if let Some(error) = result.get("error") {
                    let code = error.get("code").and_then(Value::as_str).unwrap_or_default().to_owned();
                    let message = error.get("message").and_then(Value::as_str).unwrap_or_default().to_owned();
                    let info = error
                        .get("info")
                        .and_then(Value::as_object)
                        .map(|m| m.clone().into_iter().collect())
                        .unwrap_or_default();
                    errors.push(AuditError { message, code, info });
                }
            }
        }
    }

    errors
}

fn now_millis() -> i64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() * 1000 + i64::from(now.millisecond())
}

/// The trait boundary audit records cross on their way out of the engine. Persistence is the
/// host binary's concern.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: AuditRecord) {}
}

/// Test-only in-memory sink; collects every record for assertion.
#[derive(Default)]
pub struct VecAuditSink {
    records: parking_lot::Mutex<Vec<AuditRecord>>,
}

impl VecAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for VecAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/// Non-blocking handle the pumps hold; pushes onto an unbounded channel drained by
/// [`AuditDrainTask`].
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditHandle {
    pub fn new(sink: Arc<dyn AuditSink>) -> (Self, AuditDrainTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, AuditDrainTask { rx, sink })
    }

    /// Push a record. Never blocks the caller; a dropped drain task only means records stop
    /// being consumed, not that the pump errors out.
    pub fn push(&self, record: AuditRecord) {
        let _ = self.tx.send(record);
    }
}

pub struct AuditDrainTask {
    rx: mpsc::UnboundedReceiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
}

#[async_trait::async_trait]
impl Task for AuditDrainTask {
    type Output = ();

    const NAME: &'static str = "audit drain";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                record = self.rx.recv() => {
                    match record {
                        Some(record) => self.sink.record(record),
                        None => break,
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        // Drain whatever is left without blocking on the shutdown signal again.
        while let Ok(record) = self.rx.try_recv() {
            self.sink.record(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_errors_normalized_uniformly() {
        let response = Message {
            request_id: 9,
            response: Some(serde_json::json!({
                "results": [
                    {"error": {"code": "access required", "message": "m", "info": {"model-x": "admin"}}},
                    {"error": {"code": "access required", "message": "m2", "info": {"model-y": "read"}}}
                ]
            })),
            ..Default::default()
        };
        let errors = normalize_errors(&response);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, "access required");
    }

    #[test]
    fn top_level_error_normalized() {
        let response = Message {
            request_id: 9,
            error: Some("boom".to_owned()),
            error_code: Some("some-code".to_owned()),
            ..Default::default()
        };
        let errors = normalize_errors(&response);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
    }
}
