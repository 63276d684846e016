// ABOUTME: Bus service implementations for the local service tier
// ABOUTME: Auth tokens, application registry, heartbeats, request batches and the user command relay

pub mod application;
pub mod auth;
pub mod batch;
pub mod command;

pub use application::{ApplicationService, StatusService};
pub use auth::AuthService;
pub use batch::BatchService;
pub use command::CommandRelay;

use gridlink_client::{ClientError, ServiceRequest};

use crate::registry::Registry;

/// User behind the request's auth token.
pub(crate) fn authenticate(registry: &Registry, request: &ServiceRequest) -> Result<String, ClientError> {
    let token = request
        .headers
        .auth_token()
        .ok_or_else(|| ClientError::Unauthorized("no auth token".to_string()))?;
    registry
        .user_for(token)
        .ok_or_else(|| ClientError::Unauthorized("unknown or revoked auth token".to_string()))
}
