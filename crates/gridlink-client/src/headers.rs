// ABOUTME: Immutable per-request header context carried with every service request.
// ABOUTME: Holds auth token, result limit, timeout, routing destination and subscription queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Routing key used when a request may be served by any node.
pub const ANY_NODE_KEY: &str = "request";

/// Where a request is routed within a service exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// Any node bound to the service may answer.
    #[default]
    AnyNode,
    /// Only the node bound under this address answers.
    Address(String),
}

impl Routing {
    pub fn address(address: impl Into<String>) -> Self {
        Routing::Address(address.into())
    }

    /// Bus routing key for this destination.
    pub fn key(&self) -> &str {
        match self {
            Routing::AnyNode => ANY_NODE_KEY,
            Routing::Address(address) => address,
        }
    }
}

/// Header set attached to a request.
///
/// Values are never mutated in place: every `with_*` call returns a new set,
/// so a session's defaults can be shared freely between threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHeaders {
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<Routing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscribe_queue: Option<String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn without_auth_token(mut self) -> Self {
        self.auth_token = None;
        self
    }

    pub fn with_result_limit(mut self, limit: u32) -> Self {
        self.result_limit = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_destination(mut self, destination: Routing) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_subscribe_queue(mut self, queue: impl Into<String>) -> Self {
        self.subscribe_queue = Some(queue.into());
        self
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn result_limit(&self) -> Option<u32> {
        self.result_limit
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Destination, defaulting to any node.
    pub fn destination(&self) -> Routing {
        self.destination.clone().unwrap_or_default()
    }

    pub fn subscribe_queue(&self) -> Option<&str> {
        self.subscribe_queue.as_deref()
    }

    /// Overlay `other` on top of `self`: fields set in `other` win.
    pub fn merge(&self, other: &RequestHeaders) -> RequestHeaders {
        RequestHeaders {
            auth_token: other.auth_token.clone().or_else(|| self.auth_token.clone()),
            result_limit: other.result_limit.or(self.result_limit),
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            destination: other
                .destination
                .clone()
                .or_else(|| self.destination.clone()),
            subscribe_queue: other
                .subscribe_queue
                .clone()
                .or_else(|| self.subscribe_queue.clone()),
        }
    }
}
