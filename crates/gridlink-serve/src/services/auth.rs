// ABOUTME: Auth token service: POST logs in, DELETE revokes
// ABOUTME: Credentials are checked against the registry's user table

use std::sync::Arc;

use gridlink_client::{
    AuthToken, ClientError, ResponseCallback, Service, ServiceRequest, Status, Verb,
};
use tracing::warn;

use crate::registry::Registry;

pub struct AuthService {
    registry: Arc<Registry>,
}

impl AuthService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Service for AuthService {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        let token: AuthToken = match request.payload_as() {
            Ok(token) => token,
            Err(e) => return callback.fail(&e),
        };

        match request.verb {
            Verb::Post => {
                let password = token.password.as_deref().unwrap_or_default();
                match self.registry.login(&token.login, password) {
                    Some(issued) => {
                        callback.succeed(Status::Created, &[AuthToken::issued(&token.login, issued)])
                    }
                    None => {
                        warn!(user = %token.login, "Login rejected");
                        callback.fail(&ClientError::Unauthorized(format!(
                            "invalid credentials for '{}'",
                            token.login
                        )));
                    }
                }
            }
            Verb::Delete => match token.token.as_deref() {
                Some(issued) if self.registry.logout(issued) => {
                    callback.succeed(Status::Deleted, &[token.clone()])
                }
                _ => callback.fail(&ClientError::Unauthorized(
                    "unknown or revoked auth token".to_string(),
                )),
            },
            verb => callback.fail(&ClientError::NotAllowed(format!(
                "{verb} is not supported for auth_token"
            ))),
        }
    }
}
