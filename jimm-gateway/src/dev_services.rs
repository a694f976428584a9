//! Stand-in collaborator implementations.
//!
//! `spec.md` places the identity provider, the authorization engine, and the persistent
//! controller-record store outside the proxy's scope — [`crate::services`] only carries their
//! trait shapes. To still have a binary that runs end to end, this module provides minimal,
//! explicitly non-production implementations of those traits: no real OAuth2 flow, no real
//! token signing, no real persistence. Swap every type here out before deploying anything.

use crate::config::Conf;
use crate::services::{ControllerDirectory, ControllerRecord, DeviceAuthResponse, LoginService, ResolvedController, TokenGenerator, UserTag};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

/// Accepts any credential it's handed and mints a [`UserTag`] from it directly. There is no
/// actual identity verification here; a real deployment injects a [`LoginService`] that talks
/// to an OAuth2 provider or equivalent.
#[derive(Debug, Default)]
pub struct DevLoginService;

#[async_trait]
impl LoginService for DevLoginService {
    async fn login_device(&self) -> anyhow::Result<DeviceAuthResponse> {
        let device_code = uuid::Uuid::new_v4().to_string();
        Ok(DeviceAuthResponse {
            verification_uri: "https://localhost/dev-login".to_owned(),
            user_code: device_code[..8].to_owned(),
            device_code,
        })
    }

    async fn get_device_session_token(&self, device_auth: &DeviceAuthResponse) -> anyhow::Result<String> {
        // No polling loop: the device flow is considered approved the moment it's asked for.
        Ok(format!("dev-session-token:{}", device_auth.device_code))
    }

    async fn login_with_session_token(&self, session_token: &str) -> anyhow::Result<UserTag> {
        Ok(UserTag(format!("user-{session_token}")))
    }

    async fn login_client_credentials(&self, client_id: &str, _client_secret: &str) -> anyhow::Result<UserTag> {
        Ok(UserTag(format!("user-{client_id}@serviceaccount")))
    }

    async fn login_with_session_cookie(&self, authenticated: &UserTag) -> anyhow::Result<UserTag> {
        Ok(authenticated.clone())
    }
}

/// Claim shape embedded in the unsigned placeholder tokens below. A real authorization engine
/// would sign something like this with a private key.
#[derive(Serialize)]
struct DevClaims<'a> {
    #[serde(rename = "sub", skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(rename = "permissions", skip_serializing_if = "HashMap::is_empty")]
    permissions: HashMap<String, String>,
}

/// Emits unsigned JSON claim bytes instead of a real signed JWT. Good enough to exercise the
/// wire protocol (Login params only ever carry an opaque base64 token as far as this proxy is
/// concerned) without pretending to implement real token signing.
#[derive(Debug, Default)]
pub struct DevTokenGenerator;

#[async_trait]
impl TokenGenerator for DevTokenGenerator {
    async fn make_login_token(&self, user: &UserTag) -> anyhow::Result<Vec<u8>> {
        let claims = DevClaims {
            subject: Some(user.0.as_str()),
            permissions: HashMap::new(),
        };
        Ok(serde_json::to_vec(&claims)?)
    }

    async fn make_token(&self, permissions: &HashMap<String, String>) -> anyhow::Result<Vec<u8>> {
        let claims = DevClaims {
            subject: None,
            permissions: permissions.clone(),
        };
        Ok(serde_json::to_vec(&claims)?)
    }
}

/// Resolves controller records from the static map configured in [`Conf`] rather than a real
/// persistence layer. `model_tag` is treated directly as a controller UUID key.
pub struct StaticControllerDirectory {
    controllers: HashMap<String, ControllerRecord>,
    default_controller_uuid: Option<String>,
}

impl StaticControllerDirectory {
    pub fn from_conf(conf: &Conf) -> Self {
        let default_controller_uuid = conf.controllers.keys().next().cloned();
        Self {
            controllers: conf.controllers.clone(),
            default_controller_uuid,
        }
    }
}

#[async_trait]
impl ControllerDirectory for StaticControllerDirectory {
    async fn resolve(&self, model_tag: Option<&str>) -> anyhow::Result<ResolvedController> {
        let controller_uuid = model_tag
            .map(str::to_owned)
            .or_else(|| self.default_controller_uuid.clone())
            .ok_or_else(|| anyhow::anyhow!("no controller configured"))?;

        let record = self
            .controllers
            .get(&controller_uuid)
            .ok_or_else(|| anyhow::anyhow!("unknown controller {controller_uuid}"))?
            .clone();

        Ok(ResolvedController {
            record,
            model_name: model_tag.map(str::to_owned),
            controller_uuid,
        })
    }
}
