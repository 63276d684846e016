// ABOUTME: Wire envelopes exchanged over the bus: requests, responses and subscription events.
// ABOUTME: Payloads are JSON values so the core stays independent of the domain schema.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ClientError;
use crate::headers::RequestHeaders;

/// Exchange that carries responses back to each connection's reply queue.
pub const RESPONSE_EXCHANGE: &str = "gridlink.responses";

/// Request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Put,
    Post,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "GET",
            Verb::Put => "PUT",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Response status with HTTP-like codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Created,
    Updated,
    Deleted,
    NotModified,
    BadRequest,
    Unauthorized,
    NotAllowed,
    InternalError,
    LocalError,
    UnexpectedResponse,
    ResponseTimeout,
    BusUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::Updated => 202,
            Status::Deleted => 204,
            Status::NotModified => 205,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::NotAllowed => 405,
            Status::InternalError => 500,
            Status::LocalError => 501,
            Status::UnexpectedResponse => 502,
            Status::ResponseTimeout => 503,
            Status::BusUnavailable => 504,
        }
    }

    /// 2xx codes are successes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.code())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self, self.code())
    }
}

/// Kind of change carried by a subscription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Removed,
}

/// A request as it travels to a service exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub verb: Verb,
    pub payload: Value,
    #[serde(default)]
    pub headers: RequestHeaders,
}

impl ServiceRequest {
    /// A request with a fresh id.
    pub fn new<T: Serialize>(
        verb: Verb,
        payload: &T,
        headers: RequestHeaders,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            verb,
            payload: serde_json::to_value(payload)?,
            headers,
        })
    }

    /// Decode the payload as a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A response as it travels back to the requester's reply queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: String,
    pub status: Status,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub payload: Vec<Value>,
}

impl ServiceResponse {
    /// A successful response carrying the given payload items.
    pub fn success<T: Serialize>(
        id: impl Into<String>,
        status: Status,
        items: &[T],
    ) -> Result<Self, ClientError> {
        let payload = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: id.into(),
            status,
            error_message: String::new(),
            payload,
        })
    }

    /// A failure response with no payload.
    pub fn failure(id: impl Into<String>, status: Status, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            error_message: message.into(),
            payload: Vec::new(),
        }
    }

    /// A failure response built from a client error.
    pub fn from_error(id: impl Into<String>, error: &ClientError) -> Self {
        Self::failure(id, error.status(), error.to_string())
    }
}

/// A subscription event as published on a service's event exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub payload: Value,
}
