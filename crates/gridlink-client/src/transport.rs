// ABOUTME: Seams to the physical message bus: connector, connection and delivery types.
// ABOUTME: The client core only talks to the bus through these traits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Exchange + routing key pair a message is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub exchange: String,
    pub key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.key)
    }
}

/// A message as carried by the bus.
#[derive(Debug, Clone, Default)]
pub struct BusMessage {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub reply_to: Option<Destination>,
}

impl BusMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Which queue a consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSpec {
    /// Server-named queue owned by this connection and deleted with it.
    Private,
    /// Named queue shared by every consumer that declares it; each message
    /// reaches exactly one of them.
    Shared(String),
}

/// An active consumer on a queue.
#[derive(Debug)]
pub struct Delivery {
    pub queue: String,
    pub consumer_tag: u64,
    pub messages: mpsc::UnboundedReceiver<BusMessage>,
}

/// One live transport connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Publish a message. Publishing to a key nobody listens on is not an error.
    async fn publish(&self, destination: &Destination, message: BusMessage)
        -> Result<(), ClientError>;

    /// Declare (if needed) a queue and start consuming from it.
    async fn consume(&self, queue: QueueSpec) -> Result<Delivery, ClientError>;

    /// Route messages published to `exchange` with a matching key into `queue`.
    /// Keys are dot-separated; `*` matches one word, `#` any number.
    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str)
        -> Result<(), ClientError>;

    /// Stop a consumer. Private queues are deleted with their last consumer.
    async fn cancel_consumer(&self, queue: &str, consumer_tag: u64) -> Result<(), ClientError>;

    /// Close the connection. Watchers of `closed` see an expected close.
    async fn disconnect(&self);

    /// Resolves when the connection is gone. `true` if it was closed through
    /// `disconnect`, `false` if it was lost.
    async fn closed(&self) -> bool;

    fn is_open(&self) -> bool;
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ClientError>;

    /// Human-readable target for logs. Must not include credentials.
    fn describe(&self) -> String;
}
