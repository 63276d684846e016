// ABOUTME: Error types for the gridlink-client crate.
// ABOUTME: One cloneable taxonomy shared by promises, sessions, the manager and the command tracker.

use thiserror::Error;

use crate::envelope::Status;

/// Errors surfaced by the client core.
///
/// Every variant carries owned strings so an error can be stored in a
/// completed promise and handed to any number of listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The bus is unreachable or the transport went away.
    #[error("transport error: {0}")]
    Transport(String),

    /// Login was rejected by the service tier.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Application registration was rejected.
    #[error("registration failed: {0}")]
    Registration(String),

    /// Too many heartbeats went unacknowledged.
    #[error("heartbeat timeout: {missed} consecutive heartbeats unacknowledged")]
    HeartbeatTimeout { missed: u32 },

    /// A command result arrived after its execution timed out.
    #[error("command {correlation_id} already timed out")]
    CommandTimeout { correlation_id: String },

    /// A peer or caller broke the wire contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No fully connected session is available, or the handle is stale.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Lifecycle misuse, such as starting a stopped manager.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A request got no response within its timeout.
    #[error("response timeout: {0}")]
    ResponseTimeout(String),

    /// The service tier rejected the request as malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request's auth token was missing, expired or insufficient.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The verb is not supported for the requested type.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// Any other failure status returned by a service.
    #[error("service error ({status}): {message}")]
    Service { status: Status, message: String },

    /// The response list did not have the expected number of entries.
    #[error("expectation failed: {0}")]
    Expectation(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The owned executor could not be created.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ClientError {
    /// Map a failed response status and its message onto the taxonomy.
    pub fn from_status(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            Status::BadRequest => ClientError::BadRequest(message),
            Status::Unauthorized => ClientError::Unauthorized(message),
            Status::NotAllowed => ClientError::NotAllowed(message),
            Status::ResponseTimeout => ClientError::ResponseTimeout(message),
            Status::BusUnavailable => ClientError::Transport(message),
            other => ClientError::Service {
                status: other,
                message,
            },
        }
    }

    /// Status code a service should answer with when a handler fails this way.
    pub fn status(&self) -> Status {
        match self {
            ClientError::BadRequest(_)
            | ClientError::Serialization(_)
            | ClientError::Expectation(_) => Status::BadRequest,
            ClientError::Unauthorized(_) | ClientError::Authentication(_) => Status::Unauthorized,
            ClientError::NotAllowed(_) => Status::NotAllowed,
            ClientError::ResponseTimeout(_) => Status::ResponseTimeout,
            ClientError::Transport(_) | ClientError::NotConnected(_) => Status::BusUnavailable,
            ClientError::Service { status, .. } => *status,
            _ => Status::InternalError,
        }
    }

    /// True for failures that a reconnect or retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::NotConnected(_)
                | ClientError::ResponseTimeout(_)
                | ClientError::HeartbeatTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::NotConnected("Not connected to the service tier".to_string());
        assert_eq!(
            err.to_string(),
            "not connected: Not connected to the service tier"
        );

        let err = ClientError::HeartbeatTimeout { missed: 3 };
        assert_eq!(
            err.to_string(),
            "heartbeat timeout: 3 consecutive heartbeats unacknowledged"
        );

        let err = ClientError::CommandTimeout {
            correlation_id: "abc".to_string(),
        };
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ClientError::from_status(Status::BadRequest, "x"),
            ClientError::BadRequest(_)
        ));
        assert!(matches!(
            ClientError::from_status(Status::Unauthorized, "x"),
            ClientError::Unauthorized(_)
        ));
        assert!(matches!(
            ClientError::from_status(Status::BusUnavailable, "x"),
            ClientError::Transport(_)
        ));
        assert!(matches!(
            ClientError::from_status(Status::InternalError, "boom"),
            ClientError::Service { status: Status::InternalError, ref message } if message == "boom"
        ));
    }

    #[test]
    fn test_status_round_trips_through_taxonomy() {
        for status in [
            Status::BadRequest,
            Status::Unauthorized,
            Status::NotAllowed,
            Status::ResponseTimeout,
            Status::BusUnavailable,
            Status::InternalError,
            Status::LocalError,
        ] {
            assert_eq!(ClientError::from_status(status, "m").status(), status);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Transport("down".into()).is_transient());
        assert!(ClientError::ResponseTimeout("slow".into()).is_transient());
        assert!(!ClientError::Authentication("no".into()).is_transient());
        assert!(!ClientError::ProtocolViolation("twice".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json_error() {
        let err: ClientError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, ClientError::Serialization(_)));
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = ClientError::Registration("duplicate instance".to_string());
        assert_eq!(err.clone(), err);
    }
}
