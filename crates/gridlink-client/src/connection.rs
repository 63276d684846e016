// ABOUTME: Live connection handle: reply queue, pending-request table and response dispatch.
// ABOUTME: Replaced rather than mutated on reconnect; a stale handle fails fast with NotConnected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::AuthToken;
use crate::envelope::{ServiceRequest, ServiceResponse, Verb, RESPONSE_EXCHANGE};
use crate::error::ClientError;
use crate::headers::RequestHeaders;
use crate::promise::Promise;
use crate::service::ServiceRegistration;
use crate::session::{Response, ServiceType, Session};
use crate::settings::UserSettings;
use crate::subscription::{Subscription, DEFAULT_PREBUFFER};
use crate::transport::{BrokerConnection, BusMessage, Connector, Delivery, Destination, QueueSpec};

type Responder = Box<dyn FnOnce(Result<ServiceResponse, ClientError>) + Send>;

/// A request waiting for its response.
struct PendingRequest {
    respond: Responder,
    done: CancellationToken,
}

struct ConnectionInner {
    broker: Arc<dyn BrokerConnection>,
    handle: Handle,
    generation: u64,
    reply_queue: String,
    default_timeout: Duration,
    alive: CancellationToken,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl ConnectionInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete a pending request. Returns false if it already completed or
    /// never existed.
    fn resolve(&self, id: &str, result: Result<ServiceResponse, ClientError>) -> bool {
        let entry = self.pending().remove(id);
        match entry {
            Some(entry) => {
                entry.done.cancel();
                (entry.respond)(result);
                true
            }
            None => false,
        }
    }

    /// Mark the handle dead and fail every outstanding request.
    fn invalidate(&self, reason: &str) {
        if self.alive.is_cancelled() {
            return;
        }
        self.alive.cancel();
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!(
                generation = self.generation,
                outstanding = drained.len(),
                "Failing outstanding requests"
            );
        }
        for entry in drained {
            entry.done.cancel();
            (entry.respond)(Err(ClientError::NotConnected(reason.to_string())));
        }
    }
}

/// Handle to one transport connection.
///
/// Cheap to clone. Once the transport behind it goes away every operation
/// fails with [`ClientError::NotConnected`]; callers fetch a fresh handle
/// from the manager instead of holding on to this one.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.inner.generation)
            .field("reply_queue", &self.inner.reply_queue)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Wrap a fresh transport: declare the reply queue and start dispatching
    /// responses. Must run inside a tokio runtime.
    pub async fn open(
        broker: Arc<dyn BrokerConnection>,
        generation: u64,
        default_timeout: Duration,
    ) -> Result<Connection, ClientError> {
        let delivery = broker.consume(QueueSpec::Private).await?;
        broker
            .bind_queue(&delivery.queue, RESPONSE_EXCHANGE, &delivery.queue)
            .await?;

        let inner = Arc::new(ConnectionInner {
            broker,
            handle: Handle::current(),
            generation,
            reply_queue: delivery.queue.clone(),
            default_timeout,
            alive: CancellationToken::new(),
            pending: Mutex::new(HashMap::new()),
        });
        tokio::spawn(dispatch_responses(Arc::clone(&inner), delivery));

        debug!(generation, reply_queue = %inner.reply_queue, "Connection opened");
        Ok(Connection { inner })
    }

    /// One-shot connect without reconnect supervision, for tools and service
    /// processes that own their own lifecycle.
    pub async fn establish(
        connector: &dyn Connector,
        default_timeout: Duration,
    ) -> Result<Connection, ClientError> {
        let broker = connector.connect().await?;
        Self::open(broker, 0, default_timeout).await
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub fn is_open(&self) -> bool {
        !self.inner.alive.is_cancelled() && self.inner.broker.is_open()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::NotConnected(format!(
                "connection generation {} is closed",
                self.inner.generation
            )))
        }
    }

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerConnection> {
        &self.inner.broker
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Token cancelled when this handle dies.
    pub(crate) fn liveness(&self) -> &CancellationToken {
        &self.inner.alive
    }

    /// Called by the owner when the transport went away.
    pub(crate) fn invalidate(&self, reason: &str) {
        self.inner.invalidate(reason);
    }

    /// Send a request to `exchange` and resolve with the decoded response.
    /// Callable from any thread; the publish and the timeout run on the
    /// runtime that opened the connection.
    pub fn request<Req, Resp>(
        &self,
        exchange: &str,
        verb: Verb,
        payload: &Req,
        headers: RequestHeaders,
    ) -> Promise<Response<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Clone + Send + 'static,
    {
        match ServiceRequest::new(verb, payload, headers) {
            Ok(request) => self.send(exchange, request).transform(Response::decode),
            Err(e) => Promise::err(e),
        }
    }

    /// Send an already built request and resolve with the wire response.
    /// The request's `timeout` header bounds the wait.
    pub fn send(&self, exchange: &str, request: ServiceRequest) -> Promise<ServiceResponse> {
        if let Err(e) = self.ensure_open() {
            return Promise::err(e);
        }

        let id = request.id.clone();
        let verb = request.verb;
        let timeout = request
            .headers
            .timeout()
            .unwrap_or(self.inner.default_timeout);
        let destination = Destination::new(exchange, request.headers.destination().key());
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => return Promise::err(e.into()),
        };
        let message = BusMessage::new(body)
            .with_reply_to(Destination::new(RESPONSE_EXCHANGE, &self.inner.reply_queue));

        let (promise, completer) = Promise::pending();
        let done = self.inner.alive.child_token();
        self.inner.pending().insert(
            id.clone(),
            PendingRequest {
                respond: Box::new(move |result| {
                    completer.complete(result);
                }),
                done: done.clone(),
            },
        );

        debug!(request_id = %id, verb = %verb, destination = %destination, "→ Request");

        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            if let Err(e) = inner.broker.publish(&destination, message).await {
                inner.resolve(&id, Err(e));
                return;
            }
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let reason = format!("no response to {verb} {destination} within {timeout:?}");
                    if inner.resolve(&id, Err(ClientError::ResponseTimeout(reason))) {
                        warn!(request_id = %id, "Request timed out");
                    }
                }
            }
        });

        promise
    }

    /// Open a private queue and wrap it in a subscription for `T` events.
    pub async fn subscribe<T>(&self) -> Result<Subscription<T>, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.ensure_open()?;
        let delivery = self.inner.broker.consume(QueueSpec::Private).await?;
        Ok(Subscription::spawn(
            &self.inner.handle,
            Arc::clone(&self.inner.broker),
            delivery,
            self.inner.alive.child_token(),
            DEFAULT_PREBUFFER,
        ))
    }

    /// Log in and get a session carrying the issued auth token.
    pub async fn login(&self, user: &UserSettings) -> Result<Session, ClientError> {
        let request = AuthToken::request(&user.name, &user.password);
        let response = self
            .request::<AuthToken, AuthToken>(
                AuthToken::SERVICE,
                Verb::Post,
                &request,
                RequestHeaders::new(),
            )
            .wait()
            .await?;

        let token = match response.one() {
            Ok(issued) => issued.token.ok_or_else(|| {
                ClientError::ProtocolViolation("login response carried no token".to_string())
            })?,
            Err(ClientError::Unauthorized(reason)) | Err(ClientError::BadRequest(reason)) => {
                return Err(ClientError::Authentication(reason))
            }
            Err(e) => return Err(e),
        };

        info!(user = %user.name, generation = self.inner.generation, "Logged in");
        Ok(self.create_session(token))
    }

    /// Session for an already issued token.
    pub fn create_session(&self, auth_token: impl Into<String>) -> Session {
        Session::new(
            self.clone(),
            RequestHeaders::new().with_auth_token(auth_token),
        )
    }

    /// Session without credentials, for services that do not check tokens.
    pub fn anonymous_session(&self) -> Session {
        Session::new(self.clone(), RequestHeaders::new())
    }

    /// Server-side bindings and event publishing over this connection.
    pub fn service_registration(&self) -> ServiceRegistration {
        ServiceRegistration::new(self.clone())
    }

    /// Close the transport. Outstanding requests fail with NotConnected.
    pub async fn disconnect(&self) {
        self.inner.invalidate("connection closed by client");
        self.inner.broker.disconnect().await;
    }
}

async fn dispatch_responses(inner: Arc<ConnectionInner>, mut delivery: Delivery) {
    loop {
        let message = tokio::select! {
            _ = inner.alive.cancelled() => break,
            message = delivery.messages.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        match serde_json::from_slice::<ServiceResponse>(&message.payload) {
            Ok(response) => {
                let id = response.id.clone();
                if !inner.resolve(&id, Ok(response)) {
                    debug!(request_id = %id, "Response for unknown or expired request");
                }
            }
            Err(e) => warn!(error = %e, "Dropping undecodable response"),
        }
    }
    inner.invalidate("transport closed");
    debug!(generation = inner.generation, "Response dispatch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Status;
    use crate::memory::MemoryBroker;

    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    struct Counter {
        n: u32,
    }

    impl ServiceType for Counter {
        const SERVICE: &'static str = "counter";
    }

    /// Answers every counter request on `conn` with n + 1.
    async fn echo_service(conn: &Arc<dyn BrokerConnection>) {
        let mut delivery = conn.consume(QueueSpec::Shared("counter.request".into())).await.unwrap();
        conn.bind_queue(&delivery.queue, "counter", "request").await.unwrap();
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            while let Some(message) = delivery.messages.recv().await {
                let request: ServiceRequest = serde_json::from_slice(&message.payload).unwrap();
                let counter: Counter = request.payload_as().unwrap();
                let response =
                    ServiceResponse::success(&request.id, Status::Ok, &[Counter { n: counter.n + 1 }])
                        .unwrap();
                if let Some(reply_to) = message.reply_to {
                    let body = serde_json::to_vec(&response).unwrap();
                    conn.publish(&reply_to, BusMessage::new(body)).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let broker = MemoryBroker::new();
        let server = broker.connector().connect().await.unwrap();
        echo_service(&server).await;

        let conn = Connection::establish(&broker.connector(), Duration::from_secs(1))
            .await
            .unwrap();
        let response = conn
            .request::<Counter, Counter>("counter", Verb::Get, &Counter { n: 1 }, RequestHeaders::new())
            .wait()
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.list(), &[Counter { n: 2 }]);
    }

    #[tokio::test]
    async fn test_request_without_responder_times_out() {
        let broker = MemoryBroker::new();
        let conn = Connection::establish(&broker.connector(), Duration::from_millis(50))
            .await
            .unwrap();
        let err = conn
            .request::<Counter, Counter>("counter", Verb::Get, &Counter { n: 1 }, RequestHeaders::new())
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResponseTimeout(_)));
        assert!(conn.inner.pending().is_empty());
    }

    #[tokio::test]
    async fn test_transport_loss_fails_outstanding_and_future_requests() {
        let broker = MemoryBroker::new();
        let conn = Connection::establish(&broker.connector(), Duration::from_secs(10))
            .await
            .unwrap();
        let pending = conn.request::<Counter, Counter>(
            "counter",
            Verb::Get,
            &Counter { n: 1 },
            RequestHeaders::new(),
        );

        broker.sever_connections();
        let err = tokio::time::timeout(Duration::from_secs(1), pending.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));

        assert!(!conn.is_open());
        let err = conn
            .request::<Counter, Counter>("counter", Verb::Get, &Counter { n: 1 }, RequestHeaders::new())
            .await_result()
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_handle() {
        let broker = MemoryBroker::new();
        let conn = Connection::establish(&broker.connector(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(conn.is_open());
        conn.disconnect().await;
        assert!(!conn.is_open());
        assert!(conn.subscribe::<Counter>().await.is_err());
        assert_eq!(broker.connection_count(), 0);
    }
}
