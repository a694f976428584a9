//! The error taxonomy used throughout the proxy engine.
//!
//! Mirrors the teacher's layered error style: a `thiserror`-derived enum tagging each
//! variant with an `operation` path plus an optional `#[source]` cause, so callers can
//! match on kind while still getting a chained `Display`/`Error` for logging.

use std::borrow::Cow;

pub type Operation = Cow<'static, str>;

#[derive(Debug, thiserror::Error)]
pub enum JimmError {
    #[error("[{operation}] unauthorized")]
    Unauthorized {
        operation: Operation,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("[{operation}] not supported: {message}")]
    NotSupported { operation: Operation, message: String },

    #[error("[{operation}] not found")]
    NotFound {
        operation: Operation,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("[{operation}] bad request: {message}")]
    BadRequest { operation: Operation, message: String },

    #[error("[{operation}] connection failed")]
    ConnectionFailed {
        operation: Operation,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{operation}] server misconfigured: {message}")]
    ServerConfiguration { operation: Operation, message: String },

    #[error("[{operation}] permission check required")]
    PermissionCheckRequired {
        operation: Operation,
        /// entity -> required permission level
        info: std::collections::HashMap<String, String>,
    },

    #[error("[{operation}] {source}")]
    Other {
        operation: Operation,
        #[source]
        source: anyhow::Error,
    },
}

impl JimmError {
    pub fn unauthorized(operation: impl Into<Operation>) -> Self {
        Self::Unauthorized {
            operation: operation.into(),
            source: None,
        }
    }

    pub fn not_supported(operation: impl Into<Operation>, message: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(operation: impl Into<Operation>) -> Self {
        Self::NotFound {
            operation: operation.into(),
            source: None,
        }
    }

    pub fn bad_request(operation: impl Into<Operation>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn connection_failed(operation: impl Into<Operation>, source: impl Into<anyhow::Error>) -> Self {
        Self::ConnectionFailed {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn server_configuration(operation: impl Into<Operation>, message: impl Into<String>) -> Self {
        Self::ServerConfiguration {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn other(operation: impl Into<Operation>, source: impl Into<anyhow::Error>) -> Self {
        Self::Other {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn permission_check_required(operation: impl Into<Operation>, info: std::collections::HashMap<String, String>) -> Self {
        Self::PermissionCheckRequired {
            operation: operation.into(),
            info,
        }
    }

    /// The Juju RPC error code this error maps to when sent back over the wire.
    pub fn rpc_error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized access",
            Self::NotSupported { .. } => "not supported",
            Self::NotFound { .. } => "not found",
            Self::BadRequest { .. } => "bad request",
            Self::ConnectionFailed { .. } => "connection failed",
            Self::ServerConfiguration { .. } => "server configuration error",
            Self::PermissionCheckRequired { .. } => "access required",
            Self::Other { .. } => "",
        }
    }

    pub fn rpc_message(&self) -> String {
        match self {
            Self::NotSupported { message, .. } | Self::BadRequest { message, .. } | Self::ServerConfiguration { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}
