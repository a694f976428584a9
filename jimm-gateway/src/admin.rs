//! §4.4 Admin Interceptor — routes `Admin` facade requests by method name.

use crate::error::JimmError;
use crate::message::{LoginRequest, Message};
use crate::services::{DeviceAuthResponse, LoginService, TokenGenerator, UserTag};
use base64::Engine as _;
use serde_json::json;

/// The client-facing Admin API version JIMM speaks, per §6.
pub const ADMIN_VERSION: u32 = 4;
/// The version stamped on the controller-bound Login JIMM constructs, per §4.4.
const CONTROLLER_LOGIN_VERSION: u32 = 3;

/// What the Client->Controller pump should do after the Admin interceptor has run.
pub enum AdminOutcome {
    /// Respond to the client directly; nothing is forwarded to the controller.
    Respond(Message),
    /// Forward this (rewritten) message to the controller, and remember it as the most
    /// recent login for the permission-retry path.
    ForwardAsLogin { message: Message, user: UserTag },
    /// The facade was Admin but the method is not one JIMM intercepts; forward unchanged.
    PassThrough,
    /// Fail: an error response should be sent to the client.
    Fail(JimmError),
}

/// Mutable per-session slots the interceptor reads and writes. Owned by the proxy's session
/// state; passed in by the caller since `admin::handle` itself is stateless.
pub struct AdminSessionState<'a> {
    pub device_auth: &'a mut Option<DeviceAuthResponse>,
    pub authenticated_user: &'a mut Option<UserTag>,
}

pub async fn handle(
    login_service: &dyn LoginService,
    token_generator: &dyn TokenGenerator,
    state: &mut AdminSessionState<'_>,
    message: &Message,
) -> AdminOutcome {
    match message.request.as_deref() {
        Some("LoginDevice") => login_device(login_service, state, message).await,
        Some("GetDeviceSessionToken") => get_device_session_token(login_service, state, message).await,
        Some("LoginWithSessionToken") => login_with_session_token(login_service, token_generator, message).await,
        Some("LoginWithClientCredentials") => login_with_client_credentials(login_service, token_generator, message).await,
        Some("LoginWithSessionCookie") => login_with_session_cookie(login_service, token_generator, state, message).await,
        Some("Login") => AdminOutcome::Fail(JimmError::not_supported(
            "admin.login_legacy",
            "JIMM does not support login from old clients",
        )),
        _ => AdminOutcome::PassThrough,
    }
}

async fn login_device(
    login_service: &dyn LoginService,
    state: &mut AdminSessionState<'_>,
    message: &Message,
) -> AdminOutcome {
    match login_service.login_device().await {
        Ok(device_auth) => {
            let response = Message::success_response(
                message.request_id,
                json!({
                    "verification-uri": device_auth.verification_uri,
                    "user-code": device_auth.user_code,
                }),
            );
            *state.device_auth = Some(device_auth);
            AdminOutcome::Respond(response)
        }
        Err(source) => AdminOutcome::Fail(JimmError::other("admin.login_device", source)),
    }
}

async fn get_device_session_token(
    login_service: &dyn LoginService,
    state: &mut AdminSessionState<'_>,
    message: &Message,
) -> AdminOutcome {
    let Some(device_auth) = state.device_auth.as_ref() else {
        return AdminOutcome::Fail(JimmError::bad_request(
            "admin.get_device_session_token",
            "no LoginDevice call preceded GetDeviceSessionToken",
        ));
    };

    match login_service.get_device_session_token(device_auth).await {
        Ok(session_token) => AdminOutcome::Respond(Message::success_response(
            message.request_id,
            json!({"session-token": session_token}),
        )),
        Err(source) => AdminOutcome::Fail(JimmError::other("admin.get_device_session_token", source)),
    }
}

async fn login_with_session_token(
    login_service: &dyn LoginService,
    token_generator: &dyn TokenGenerator,
    message: &Message,
) -> AdminOutcome {
    let Some(session_token) = message
        .params
        .as_ref()
        .and_then(|p| p.get("session-token"))
        .and_then(serde_json::Value::as_str)
    else {
        return AdminOutcome::Fail(JimmError::bad_request(
            "admin.login_with_session_token",
            "missing session-token parameter",
        ));
    };

    match login_service.login_with_session_token(session_token).await {
        Ok(user) => build_login_outcome(token_generator, message.request_id, &user).await,
        Err(source) => AdminOutcome::Fail(JimmError::unauthorized_with("admin.login_with_session_token", source)),
    }
}

async fn login_with_client_credentials(
    login_service: &dyn LoginService,
    token_generator: &dyn TokenGenerator,
    message: &Message,
) -> AdminOutcome {
    let params = message.params.as_ref();
    let client_id = params.and_then(|p| p.get("client-id")).and_then(serde_json::Value::as_str);
    let client_secret = params
        .and_then(|p| p.get("client-secret"))
        .and_then(serde_json::Value::as_str);

    let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
        return AdminOutcome::Fail(JimmError::bad_request(
            "admin.login_with_client_credentials",
            "missing client-id or client-secret parameter",
        ));
    };

    match login_service.login_client_credentials(client_id, client_secret).await {
        Ok(user) => build_login_outcome(token_generator, message.request_id, &user).await,
        Err(source) => AdminOutcome::Fail(JimmError::unauthorized_with("admin.login_with_client_credentials", source)),
    }
}

async fn login_with_session_cookie(
    login_service: &dyn LoginService,
    token_generator: &dyn TokenGenerator,
    state: &mut AdminSessionState<'_>,
    message: &Message,
) -> AdminOutcome {
    let Some(authenticated) = state.authenticated_user.as_ref() else {
        return AdminOutcome::Fail(JimmError::unauthorized("admin.login_with_session_cookie"));
    };

    match login_service.login_with_session_cookie(authenticated).await {
        Ok(user) => build_login_outcome(token_generator, message.request_id, &user).await,
        Err(source) => AdminOutcome::Fail(JimmError::unauthorized_with("admin.login_with_session_cookie", source)),
    }
}

/// Shared tail of every successful login path: mint the JWT, build the controller-bound
/// `Login` message.
async fn build_login_outcome(token_generator: &dyn TokenGenerator, request_id: u64, user: &UserTag) -> AdminOutcome {
    match token_generator.make_login_token(user).await {
        Ok(jwt) => {
            let token = base64::engine::general_purpose::STANDARD.encode(jwt);
            let login_request = LoginRequest {
                auth_tag: user.0.clone(),
                token,
            };
            let params = match serde_json::to_value(&login_request) {
                Ok(v) => v,
                Err(e) => return AdminOutcome::Fail(JimmError::other("admin.build_login_outcome", e)),
            };
            let message = Message {
                request_id,
                facade_type: Some("Admin".to_owned()),
                request: Some("Login".to_owned()),
                version: Some(CONTROLLER_LOGIN_VERSION),
                params: Some(params),
                ..Default::default()
            };
            AdminOutcome::ForwardAsLogin {
                message,
                user: user.clone(),
            }
        }
        Err(source) => AdminOutcome::Fail(JimmError::other("admin.build_login_outcome", source)),
    }
}

impl JimmError {
    fn unauthorized_with(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Unauthorized {
            operation: operation.into(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::DeviceAuthResponse;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeLoginService;

    #[async_trait]
    impl LoginService for FakeLoginService {
        async fn login_device(&self) -> anyhow::Result<DeviceAuthResponse> {
            Ok(DeviceAuthResponse {
                verification_uri: "http://example/verify".to_owned(),
                user_code: "ABCD-EFGH".to_owned(),
                device_code: "internal-device-code".to_owned(),
            })
        }

        async fn get_device_session_token(&self, _device_auth: &DeviceAuthResponse) -> anyhow::Result<String> {
            Ok("session-token".to_owned())
        }

        async fn login_with_session_token(&self, _session_token: &str) -> anyhow::Result<UserTag> {
            Ok(UserTag("user-alice".to_owned()))
        }

        async fn login_client_credentials(&self, client_id: &str, _client_secret: &str) -> anyhow::Result<UserTag> {
            Ok(UserTag(format!("user-{client_id}@serviceaccount")))
        }

        async fn login_with_session_cookie(&self, authenticated: &UserTag) -> anyhow::Result<UserTag> {
            Ok(authenticated.clone())
        }
    }

    struct FakeTokenGenerator;

    #[async_trait]
    impl TokenGenerator for FakeTokenGenerator {
        async fn make_login_token(&self, _user: &UserTag) -> anyhow::Result<Vec<u8>> {
            Ok(b"fake-jwt".to_vec())
        }

        async fn make_token(&self, _permissions: &HashMap<String, String>) -> anyhow::Result<Vec<u8>> {
            Ok(b"fake-upgraded-jwt".to_vec())
        }
    }

    #[tokio::test]
    async fn device_login_does_not_reach_controller() {
        let login_service = FakeLoginService;
        let token_generator = FakeTokenGenerator;
        let mut device_auth = None;
        let mut authenticated_user = None;
        let mut state = AdminSessionState {
            device_auth: &mut device_auth,
            authenticated_user: &mut authenticated_user,
        };

        let message = Message {
            request_id: 1,
            facade_type: Some("Admin".to_owned()),
            version: Some(4),
            request: Some("LoginDevice".to_owned()),
            ..Default::default()
        };

        match handle(&login_service, &token_generator, &mut state, &message).await {
            AdminOutcome::Respond(response) => {
                assert_eq!(response.response.unwrap()["user-code"], "ABCD-EFGH");
            }
            _ => panic!("expected a direct response"),
        }
        assert!(device_auth.is_some());
    }

    #[tokio::test]
    async fn client_credentials_build_controller_login() {
        let login_service = FakeLoginService;
        let token_generator = FakeTokenGenerator;
        let mut device_auth = None;
        let mut authenticated_user = None;
        let mut state = AdminSessionState {
            device_auth: &mut device_auth,
            authenticated_user: &mut authenticated_user,
        };

        let message = Message {
            request_id: 1,
            facade_type: Some("Admin".to_owned()),
            version: Some(4),
            request: Some("LoginWithClientCredentials".to_owned()),
            params: Some(json!({"client-id": "cid", "client-secret": "csec"})),
            ..Default::default()
        };

        match handle(&login_service, &token_generator, &mut state, &message).await {
            AdminOutcome::ForwardAsLogin { message: rewritten, user } => {
                assert_eq!(rewritten.facade_type.as_deref(), Some("Admin"));
                assert_eq!(rewritten.request.as_deref(), Some("Login"));
                assert_eq!(rewritten.version, Some(3));
                let params: LoginRequest = serde_json::from_value(rewritten.params.unwrap()).unwrap();
                assert_eq!(params.auth_tag, "user-cid@serviceaccount");
                assert!(!params.token.is_empty());
                assert_eq!(user.0, "user-cid@serviceaccount");
            }
            _ => panic!("expected a forwarded login"),
        }
    }

    #[tokio::test]
    async fn legacy_login_is_rejected() {
        let login_service = FakeLoginService;
        let token_generator = FakeTokenGenerator;
        let mut device_auth = None;
        let mut authenticated_user = None;
        let mut state = AdminSessionState {
            device_auth: &mut device_auth,
            authenticated_user: &mut authenticated_user,
        };

        let message = Message {
            request_id: 1,
            facade_type: Some("Admin".to_owned()),
            version: Some(3),
            request: Some("Login".to_owned()),
            ..Default::default()
        };

        match handle(&login_service, &token_generator, &mut state, &message).await {
            AdminOutcome::Fail(JimmError::NotSupported { message, .. }) => {
                assert!(message.contains("does not support login"));
            }
            _ => panic!("expected NotSupported"),
        }
    }

    #[tokio::test]
    async fn login_with_session_cookie_requires_prior_authentication() {
        let login_service = FakeLoginService;
        let token_generator = FakeTokenGenerator;
        let mut device_auth = None;
        let mut authenticated_user = None;
        let mut state = AdminSessionState {
            device_auth: &mut device_auth,
            authenticated_user: &mut authenticated_user,
        };

        let message = Message {
            request_id: 1,
            facade_type: Some("Admin".to_owned()),
            version: Some(4),
            request: Some("LoginWithSessionCookie".to_owned()),
            ..Default::default()
        };

        match handle(&login_service, &token_generator, &mut state, &message).await {
            AdminOutcome::Fail(JimmError::Unauthorized { .. }) => {}
            _ => panic!("expected Unauthorized"),
        }
    }
}
