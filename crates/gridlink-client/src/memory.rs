// ABOUTME: In-process message bus with exchanges, topic bindings and competing consumers.
// ABOUTME: Backs local deployments and tests; can simulate outages and dropped connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::ClientError;
use crate::settings::BrokerSettings;
use crate::transport::{
    BrokerConnection, BusMessage, Connector, Delivery, Destination, QueueSpec,
};

/// Liveness flags shared between the broker and one connection.
struct ConnectionFlags {
    closed: CancellationToken,
    expected: AtomicBool,
}

struct Consumer {
    tag: u64,
    connection: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct QueueState {
    /// Connection that owns a private queue; `None` for shared queues.
    owner: Option<u64>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

impl QueueState {
    /// Hand the message to the next live consumer, round-robin.
    fn deliver(&mut self, message: BusMessage) -> bool {
        self.consumers.retain(|c| !c.tx.is_closed());
        if self.consumers.is_empty() {
            return false;
        }
        let index = self.cursor % self.consumers.len();
        self.cursor = index + 1;
        self.consumers[index].tx.send(message).is_ok()
    }
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

struct BrokerState {
    available: bool,
    credentials: Option<(String, String)>,
    next_id: u64,
    connections: HashMap<u64, Arc<ConnectionFlags>>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
    }
}

/// In-process bus. Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker that accepts any credentials.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                credentials: None,
                next_id: 0,
                connections: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
            })),
        }
    }

    /// A broker that only admits the given user.
    pub fn with_credentials(user: impl Into<String>, password: impl Into<String>) -> Self {
        let broker = Self::new();
        broker.lock().credentials = Some((user.into(), password.into()));
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector that logs in anonymously.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            user: None,
            password: None,
            virtual_host: "/".to_string(),
        }
    }

    /// Connector that logs in with the user from broker settings.
    pub fn connector_for(&self, settings: &BrokerSettings) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            user: Some(settings.user.clone()),
            password: Some(settings.password.clone()),
            virtual_host: settings.virtual_host.clone(),
        }
    }

    /// Take the broker down or bring it back. Going down drops every
    /// connection as an unexpected loss and refuses new ones.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
        info!(available, "Memory broker availability changed");
        if !available {
            self.sever_connections();
        }
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    /// Drop every open connection as if the network failed.
    pub fn sever_connections(&self) {
        let ids: Vec<u64> = self.lock().connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, false);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    fn open_connection(
        &self,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<MemoryConnection, ClientError> {
        let mut state = self.lock();
        if !state.available {
            return Err(ClientError::Transport("broker unavailable".to_string()));
        }
        if let Some((expected_user, expected_password)) = &state.credentials {
            if user != Some(expected_user.as_str()) || password != Some(expected_password.as_str())
            {
                return Err(ClientError::Transport(format!(
                    "access refused for user '{}'",
                    user.unwrap_or("guest")
                )));
            }
        }

        let id = state.next_id();
        let flags = Arc::new(ConnectionFlags {
            closed: CancellationToken::new(),
            expected: AtomicBool::new(false),
        });
        state.connections.insert(id, Arc::clone(&flags));
        debug!(connection = id, "Memory broker accepted connection");

        Ok(MemoryConnection {
            id,
            broker: self.clone(),
            flags,
        })
    }

    fn close_connection(&self, id: u64, expected: bool) {
        let flags = {
            let mut state = self.lock();
            let Some(flags) = state.connections.remove(&id) else {
                return;
            };
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|c| c.connection != id);
            }
            let owned: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.owner == Some(id))
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                state.delete_queue(&name);
            }
            flags
        };

        flags.expected.store(expected, Ordering::SeqCst);
        flags.closed.cancel();
        debug!(connection = id, expected, "Memory broker closed connection");
    }

    fn route(&self, destination: &Destination, message: BusMessage) -> usize {
        let mut state = self.lock();
        let mut targets: Vec<String> = Vec::new();
        for binding in &state.bindings {
            if binding.exchange == destination.exchange
                && topic_matches(&binding.pattern, &destination.key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        let mut delivered = 0;
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                if queue.deliver(message.clone()) {
                    delivered += 1;
                }
            }
        }
        trace!(destination = %destination, delivered, "Memory broker routed message");
        delivered
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// Opens connections to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    user: Option<String>,
    password: Option<String>,
    virtual_host: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        let connection = self
            .broker
            .open_connection(self.user.as_deref(), self.password.as_deref())?;
        Ok(Arc::new(connection))
    }

    fn describe(&self) -> String {
        format!(
            "memory:/{}@local{}",
            self.user.as_deref().unwrap_or("guest"),
            self.virtual_host
        )
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    flags: Arc<ConnectionFlags>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.flags.closed.is_cancelled() {
            Err(ClientError::Transport("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(
        &self,
        destination: &Destination,
        message: BusMessage,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.broker.route(destination, message);
        Ok(())
    }

    async fn consume(&self, queue: QueueSpec) -> Result<Delivery, ClientError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.lock();
        let tag = state.next_id();

        let name = match queue {
            QueueSpec::Private => {
                let name = format!("gen-{}", Uuid::new_v4());
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        owner: Some(self.id),
                        ..Default::default()
                    },
                );
                name
            }
            QueueSpec::Shared(name) => {
                state.queues.entry(name.clone()).or_default();
                name
            }
        };

        if let Some(queue) = state.queues.get_mut(&name) {
            queue.consumers.push(Consumer {
                tag,
                connection: self.id,
                tx,
            });
        }

        Ok(Delivery {
            queue: name,
            consumer_tag: tag,
            messages: rx,
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(ClientError::Transport(format!("no queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn cancel_consumer(&self, queue: &str, consumer_tag: u64) -> Result<(), ClientError> {
        let mut state = self.broker.lock();
        let delete = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumers.retain(|c| c.tag != consumer_tag);
                q.owner.is_some() && q.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            state.delete_queue(queue);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.broker.close_connection(self.id, true);
    }

    async fn closed(&self) -> bool {
        self.flags.closed.cancelled().await;
        self.flags.expected.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        !self.flags.closed.is_cancelled()
    }
}
