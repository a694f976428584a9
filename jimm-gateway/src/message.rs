//! The Juju JSON-RPC wire format.
//!
//! A [`Message`] is the unit exchanged on any RPC WebSocket, in either direction. The proxy
//! never has a full schema for `params`/`response` — those are kept as raw JSON and only
//! parsed at the handful of well-known intercept points (Admin dispatch, `access required`
//! detection, the `servers` strip).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Identifies a single request/response pair on an RPC WebSocket.
///
/// A request-id of zero never appears on valid traffic; receiving one is a protocol error.
pub type RequestId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Message {
    #[serde(rename = "request-id")]
    pub request_id: RequestId,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub facade_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "error-code", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(rename = "error-info", default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<HashMap<String, Value>>,
}

impl Message {
    /// A message is a request iff both `type` and `request` are non-empty.
    pub fn is_request(&self) -> bool {
        non_empty(&self.facade_type) && non_empty(&self.request)
    }

    pub fn is_admin_facade(&self) -> bool {
        self.facade_type.as_deref() == Some("Admin")
    }

    pub fn error_response(request_id: RequestId, code: &str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            error: Some(message.into()),
            error_code: Some(code.to_owned()),
            ..Default::default()
        }
    }

    pub fn success_response(request_id: RequestId, response: Value) -> Self {
        Self {
            request_id,
            response: Some(response),
            ..Default::default()
        }
    }

    /// Is this response carrying the top-level `access required` error code?
    pub fn is_access_required(&self) -> bool {
        self.error_code.as_deref() == Some(ACCESS_REQUIRED_CODE)
    }
}

fn non_empty(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|s| !s.is_empty())
}

/// The error code a controller emits when the caller's token is missing a claim.
pub const ACCESS_REQUIRED_CODE: &str = "access required";

/// Params/response shape of the `Admin(3).Login` request forwarded to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "auth-tag")]
    pub auth_tag: String,
    pub token: String,
}

/// A single `{error:{code, info}}` entry inside a bulk `results` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkResult {
    #[serde(default)]
    pub error: Option<BulkError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkError {
    pub code: Option<String>,
    #[serde(default)]
    pub info: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    pub results: Vec<BulkResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_detection() {
        let mut msg = Message {
            request_id: 1,
            facade_type: Some("Admin".to_owned()),
            request: Some("Login".to_owned()),
            ..Default::default()
        };
        assert!(msg.is_request());

        msg.request = None;
        assert!(!msg.is_request());
    }

    #[test]
    fn round_trip_preserves_opaque_params() {
        let raw = serde_json::json!({
            "request-id": 7,
            "type": "Client",
            "version": 2,
            "request": "ListModels",
            "params": {"user": "alice", "nested": {"a": [1,2,3]}}
        });
        let msg: Message = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["params"], raw["params"]);
    }
}
