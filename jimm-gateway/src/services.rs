//! External collaborator interfaces.
//!
//! `spec.md` treats the persistent controller store, the identity services, and the
//! authorization engine as collaborators living outside the proxy core. This module only
//! carries the shapes the proxy needs to talk to them: the `ControllerRecord` data, and the
//! `LoginService` / `TokenGenerator` trait boundaries. Concrete implementations (talking to
//! an OAuth2 provider, a Macaroon bakery, whatever) are injected by the host binary.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Reachability scope tag carried by each alternate controller address.
///
/// Only `Public` and `CloudLocal` (plus the legacy empty-string scope, folded into
/// `CloudLocal` at parse time) are dialled; everything else (e.g. `machine-local`) is
/// filtered out before racing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressScope {
    Public,
    CloudLocal,
    Other,
}

impl AddressScope {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "public" => Self::Public,
            "cloud-local" | "" => Self::CloudLocal,
            _ => Self::Other,
        }
    }

    fn is_dialable(self) -> bool {
        matches!(self, Self::Public | Self::CloudLocal)
    }
}

/// One alternate `host:port` candidate for a controller.
#[derive(Debug, Clone)]
pub struct CandidateAddress {
    pub host_port: String,
    pub scope: AddressScope,
}

/// A controller's connection details, as retrieved from the (out-of-scope) persistent
/// store.
#[derive(Debug, Clone)]
pub struct ControllerRecord {
    /// PEM-encoded CA certificate. Empty means "use the system trust store".
    pub ca_certificate: String,
    pub tls_hostname: String,
    pub public_address: Option<String>,
    pub addresses: Vec<CandidateAddress>,
}

impl ControllerRecord {
    /// Candidate addresses in the order the HTTP passthrough (§4.6) tries them: the public
    /// address first (if set), then the filtered `addresses` list. Unlike the WebSocket
    /// dialer, the passthrough always walks this whole list in order on transport failure.
    pub fn dial_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();

        if let Some(public) = &self.public_address {
            candidates.push(public.clone());
        }

        candidates.extend(self.fallback_candidates());
        candidates
    }

    /// The filtered `addresses` list the WebSocket dialer races once the public address is
    /// absent or has failed (§4.1 steps 2-3): only `public`/`cloud-local`/unscoped entries,
    /// excluding whatever's already `public_address`.
    pub fn fallback_candidates(&self) -> Vec<String> {
        self.addresses
            .iter()
            .filter(|addr| addr.scope.is_dialable() && Some(&addr.host_port) != self.public_address.as_ref())
            .map(|addr| addr.host_port.clone())
            .collect()
    }
}

/// A resource tag identifying the authenticated caller, e.g. `user-alice` or
/// `user-cid@serviceaccount`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserTag(pub String);

impl fmt::Display for UserTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The state handed back by `LoginService::login_device` and consumed by
/// `LoginService::get_device_session_token`.
#[derive(Debug, Clone)]
pub struct DeviceAuthResponse {
    pub verification_uri: String,
    pub user_code: String,
    /// Opaque identifier the service uses internally to correlate the device flow; not
    /// shown to the client.
    pub device_code: String,
}

/// The OAuth2 / session / client-credential identity surface.
///
/// All methods are fallible with an arbitrary `anyhow::Error`; the Admin interceptor
/// classifies failures into the shared `JimmError` taxonomy at the call site.
#[async_trait]
pub trait LoginService: Send + Sync {
    async fn login_device(&self) -> anyhow::Result<DeviceAuthResponse>;

    async fn get_device_session_token(&self, device_auth: &DeviceAuthResponse) -> anyhow::Result<String>;

    async fn login_with_session_token(&self, session_token: &str) -> anyhow::Result<UserTag>;

    async fn login_client_credentials(&self, client_id: &str, client_secret: &str) -> anyhow::Result<UserTag>;

    async fn login_with_session_cookie(&self, authenticated: &UserTag) -> anyhow::Result<UserTag>;
}

/// The authorization engine surface: mints the JWTs attached to controller-bound Logins.
#[async_trait]
pub trait TokenGenerator: Send + Sync {
    /// Mint the token attached to the very first Login for a user (no extra claims yet).
    async fn make_login_token(&self, user: &UserTag) -> anyhow::Result<Vec<u8>>;

    /// Mint an upgraded token carrying the given `entity -> level` permission claims, used
    /// by the permission-retry path.
    async fn make_token(&self, permissions: &HashMap<String, String>) -> anyhow::Result<Vec<u8>>;
}

/// What dialing a client's requested model tag (or the controller-only path) resolves to.
pub struct ResolvedController {
    pub record: ControllerRecord,
    pub model_name: Option<String>,
    pub controller_uuid: String,
}

/// The persistent controller-record store. Out of scope per `spec.md`; only its interface
/// appears here.
#[async_trait]
pub trait ControllerDirectory: Send + Sync {
    async fn resolve(&self, model_tag: Option<&str>) -> anyhow::Result<ResolvedController>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("public", AddressScope::Public)]
    #[case("cloud-local", AddressScope::CloudLocal)]
    #[case("", AddressScope::CloudLocal)]
    #[case("machine-local", AddressScope::Other)]
    #[case("unknown-future-scope", AddressScope::Other)]
    fn scope_parsing(#[case] raw: &str, #[case] expected: AddressScope) {
        assert_eq!(AddressScope::parse(raw), expected);
    }

    #[rstest]
    #[case(AddressScope::Public, true)]
    #[case(AddressScope::CloudLocal, true)]
    #[case(AddressScope::Other, false)]
    fn dialability(#[case] scope: AddressScope, #[case] expected: bool) {
        assert_eq!(scope.is_dialable(), expected);
    }
}
