// ABOUTME: Server side of the bus: request handler bindings and subscription event publishing.
// ABOUTME: Handlers answer through a single-fire ResponseCallback; each binding cancels on its own.

use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::envelope::{EventEnvelope, EventType, ServiceRequest, ServiceResponse, Status};
use crate::error::ClientError;
use crate::headers::Routing;
use crate::session::ServiceType;
use crate::transport::{BrokerConnection, BusMessage, Delivery, Destination, QueueSpec};

/// Handles requests arriving on a bound exchange.
///
/// `respond` runs on the binding's delivery task, one request at a time.
/// Long work should move elsewhere and answer through the callback later.
pub trait Service: Send + Sync + 'static {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback);
}

impl<F> Service for F
where
    F: Fn(ServiceRequest, ResponseCallback) + Send + Sync + 'static,
{
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        self(request, callback)
    }
}

struct ReplyRoute {
    broker: Arc<dyn BrokerConnection>,
    handle: Handle,
    reply_to: Destination,
}

/// Sends exactly one response for one request.
///
/// Consumed by every answering method. Dropping it unanswered sends an
/// INTERNAL_ERROR so the requester does not wait for its timeout.
pub struct ResponseCallback {
    request_id: String,
    route: Option<ReplyRoute>,
}

impl std::fmt::Debug for ResponseCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCallback")
            .field("request_id", &self.request_id)
            .field("pending", &self.route.is_some())
            .finish()
    }
}

impl ResponseCallback {
    fn new(request_id: String, route: Option<ReplyRoute>) -> Self {
        Self { request_id, route }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Send `response`, with its id forced to the request's.
    pub fn respond(mut self, mut response: ServiceResponse) {
        response.id = self.request_id.clone();
        self.send(response);
    }

    pub fn succeed<T: Serialize>(self, status: Status, items: &[T]) {
        match ServiceResponse::success(self.request_id.clone(), status, items) {
            Ok(response) => self.respond(response),
            Err(e) => self.fail(&e),
        }
    }

    pub fn fail(self, error: &ClientError) {
        let response = ServiceResponse::from_error(self.request_id.clone(), error);
        self.respond(response);
    }

    fn send(&mut self, response: ServiceResponse) {
        let Some(route) = self.route.take() else {
            return;
        };
        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!(request_id = %response.id, error = %e, "Cannot encode response");
                return;
            }
        };
        debug!(request_id = %response.id, status = %response.status, "← Response");
        route.handle.spawn(async move {
            if let Err(e) = route
                .broker
                .publish(&route.reply_to, BusMessage::new(body))
                .await
            {
                debug!(reply_to = %route.reply_to, error = %e, "Response not delivered");
            }
        });
    }
}

impl Drop for ResponseCallback {
    fn drop(&mut self) {
        if self.route.is_some() {
            warn!(request_id = %self.request_id, "Request dropped without a response");
            let response = ServiceResponse::failure(
                self.request_id.clone(),
                Status::InternalError,
                "service dropped the request without responding",
            );
            self.send(response);
        }
    }
}

/// A live handler binding. Cancelling stops future deliveries; requests
/// already handed to the handler still get their responses.
#[derive(Debug, Clone)]
pub struct ServiceBinding {
    id: String,
    exchange: String,
    key: String,
    cancel: CancellationToken,
}

impl ServiceBinding {
    /// Queue the binding consumes from.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Binds handlers and publishes events over one connection.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    connection: Connection,
}

impl ServiceRegistration {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Serve requests for `T` addressed to `destination`.
    ///
    /// Competing bindings share one queue per service and destination, so
    /// each request reaches one of them. Other bindings each get a private
    /// queue and see every request.
    pub async fn bind_service<T: ServiceType>(
        &self,
        service: Arc<dyn Service>,
        destination: Routing,
        competing: bool,
    ) -> Result<ServiceBinding, ClientError> {
        self.bind_exchange(T::SERVICE, service, destination, competing)
            .await
    }

    /// Untyped form of [`bind_service`](Self::bind_service).
    pub async fn bind_exchange(
        &self,
        exchange: &str,
        service: Arc<dyn Service>,
        destination: Routing,
        competing: bool,
    ) -> Result<ServiceBinding, ClientError> {
        self.connection.ensure_open()?;
        let key = destination.key().to_string();
        let queue = if competing {
            QueueSpec::Shared(format!("{exchange}.{key}"))
        } else {
            QueueSpec::Private
        };

        let broker = Arc::clone(self.connection.broker());
        let delivery = broker.consume(queue).await?;
        if let Err(e) = broker.bind_queue(&delivery.queue, exchange, &key).await {
            let _ = broker
                .cancel_consumer(&delivery.queue, delivery.consumer_tag)
                .await;
            return Err(e);
        }

        let cancel = self.connection.liveness().child_token();
        let binding = ServiceBinding {
            id: delivery.queue.clone(),
            exchange: exchange.to_string(),
            key,
            cancel: cancel.clone(),
        };
        info!(
            exchange = %binding.exchange,
            key = %binding.key,
            competing,
            queue = %binding.id,
            "Service bound"
        );

        let handle = self.connection.handle().clone();
        handle.spawn(serve_requests(
            broker,
            handle.clone(),
            delivery,
            service,
            cancel,
        ));
        Ok(binding)
    }

    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher {
            connection: self.connection.clone(),
        }
    }
}

async fn serve_requests(
    broker: Arc<dyn BrokerConnection>,
    handle: Handle,
    mut delivery: Delivery,
    service: Arc<dyn Service>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = delivery.messages.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let route = message.reply_to.clone().map(|reply_to| ReplyRoute {
            broker: Arc::clone(&broker),
            handle: handle.clone(),
            reply_to,
        });
        match serde_json::from_slice::<ServiceRequest>(&message.payload) {
            Ok(request) => {
                debug!(request_id = %request.id, verb = %request.verb, queue = %delivery.queue, "→ Serving");
                let callback = ResponseCallback::new(request.id.clone(), route);
                service.respond(request, callback);
            }
            Err(e) => {
                warn!(queue = %delivery.queue, error = %e, "Undecodable request");
                ResponseCallback::new(String::new(), route)
                    .fail(&ClientError::BadRequest(e.to_string()));
            }
        }
    }

    cancel.cancel();
    let _ = broker
        .cancel_consumer(&delivery.queue, delivery.consumer_tag)
        .await;
    debug!(queue = %delivery.queue, "Service unbound");
}

/// Publishes subscription events for service types.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    connection: Connection,
}

impl EventPublisher {
    /// Best effort: no acknowledgment and no retry.
    pub async fn publish_event<T: ServiceType>(
        &self,
        event_type: EventType,
        value: &T,
        routing_key: &str,
    ) -> Result<(), ClientError> {
        self.connection.ensure_open()?;
        let envelope = EventEnvelope {
            event_type,
            payload: serde_json::to_value(value)?,
        };
        let body = serde_json::to_vec(&envelope)?;
        let destination = Destination::new(T::event_exchange(), routing_key);
        debug!(destination = %destination, event = ?event_type, "Publishing event");
        self.connection
            .broker()
            .publish(&destination, BusMessage::new(body))
            .await
    }

    /// Route `T` events with keys matching `routing_key` into a subscriber's
    /// queue, typically the one named in a request's subscribe header.
    pub async fn bind_queue<T: ServiceType>(
        &self,
        subscribe_queue: &str,
        routing_key: &str,
    ) -> Result<(), ClientError> {
        self.connection.ensure_open()?;
        self.connection
            .broker()
            .bind_queue(subscribe_queue, &T::event_exchange(), routing_key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::RequestHeaders;
    use crate::memory::MemoryBroker;
    use crate::session::Session;
    use crate::subscription::SubscriptionEvent;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Breaker {
        name: String,
        closed: bool,
    }

    impl ServiceType for Breaker {
        const SERVICE: &'static str = "breaker";
    }

    fn breaker(name: &str) -> Breaker {
        Breaker {
            name: name.into(),
            closed: true,
        }
    }

    async fn connect(broker: &MemoryBroker) -> Connection {
        Connection::establish(&broker.connector(), Duration::from_millis(500))
            .await
            .unwrap()
    }

    /// Echoes the request and counts how often it was called.
    fn counting_echo(count: Arc<AtomicUsize>) -> Arc<dyn Service> {
        Arc::new(move |request: ServiceRequest, callback: ResponseCallback| {
            count.fetch_add(1, Ordering::SeqCst);
            match request.payload_as::<Breaker>() {
                Ok(breaker) => callback.succeed(Status::Ok, &[breaker]),
                Err(e) => callback.fail(&e),
            }
        })
    }

    #[tokio::test]
    async fn test_bound_service_answers_session_requests() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let count = Arc::new(AtomicUsize::new(0));
        server
            .service_registration()
            .bind_service::<Breaker>(counting_echo(count.clone()), Routing::AnyNode, true)
            .await
            .unwrap();

        let session = connect(&broker).await.anonymous_session();
        let answer = session.get(&breaker("cb-1")).one().wait().await.unwrap();
        assert_eq!(answer, breaker("cb-1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_competing_bindings_split_requests() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let registration = server.service_registration();
        registration
            .bind_service::<Breaker>(counting_echo(first.clone()), Routing::AnyNode, true)
            .await
            .unwrap();
        registration
            .bind_service::<Breaker>(counting_echo(second.clone()), Routing::AnyNode, true)
            .await
            .unwrap();

        let session = connect(&broker).await.anonymous_session();
        for _ in 0..4 {
            session.get(&breaker("cb")).one().wait().await.unwrap();
        }
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broadcast_bindings_all_receive() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let registration = server.service_registration();
        registration
            .bind_service::<Breaker>(counting_echo(first.clone()), Routing::AnyNode, false)
            .await
            .unwrap();
        registration
            .bind_service::<Breaker>(counting_echo(second.clone()), Routing::AnyNode, false)
            .await
            .unwrap();

        let session = connect(&broker).await.anonymous_session();
        // First response wins; the duplicate is ignored by the requester.
        session.get(&breaker("cb")).one().wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_addressed_requests_reach_only_that_node() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let any = Arc::new(AtomicUsize::new(0));
        let addressed = Arc::new(AtomicUsize::new(0));
        let registration = server.service_registration();
        registration
            .bind_service::<Breaker>(counting_echo(any.clone()), Routing::AnyNode, true)
            .await
            .unwrap();
        registration
            .bind_service::<Breaker>(
                counting_echo(addressed.clone()),
                Routing::address("node-7"),
                true,
            )
            .await
            .unwrap();

        let session = connect(&broker).await.anonymous_session();
        let headers = RequestHeaders::new().with_destination(Routing::address("node-7"));
        session
            .request(crate::envelope::Verb::Get, &breaker("cb"), &headers)
            .one()
            .wait()
            .await
            .unwrap();
        assert_eq!(addressed.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_callback_answers_internal_error() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let service: Arc<dyn Service> = Arc::new(|_: ServiceRequest, _: ResponseCallback| {});
        server
            .service_registration()
            .bind_service::<Breaker>(service, Routing::AnyNode, true)
            .await
            .unwrap();

        let session = connect(&broker).await.anonymous_session();
        let response = session.get(&breaker("cb")).wait().await.unwrap();
        assert_eq!(response.status(), Status::InternalError);
    }

    #[tokio::test]
    async fn test_cancelled_binding_stops_serving() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let count = Arc::new(AtomicUsize::new(0));
        let binding = server
            .service_registration()
            .bind_service::<Breaker>(counting_echo(count.clone()), Routing::AnyNode, false)
            .await
            .unwrap();
        binding.cancel();
        binding.cancel();
        assert!(binding.is_cancelled());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!broker.has_queue(binding.id()));

        let client = Connection::establish(&broker.connector(), Duration::from_millis(50))
            .await
            .unwrap();
        let err = client
            .anonymous_session()
            .get(&breaker("cb"))
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResponseTimeout(_)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_events_reach_bound_subscription() {
        let broker = MemoryBroker::new();
        let server = connect(&broker).await;
        let session = Session::new(connect(&broker).await, RequestHeaders::new());

        let subscription = session.subscribe::<Breaker>().await.unwrap();
        let publisher = server.service_registration().event_publisher();
        publisher
            .bind_queue::<Breaker>(subscription.id(), "yard.#")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscription
            .start(move |event: SubscriptionEvent<Breaker>| {
                let _ = tx.send(event);
            })
            .unwrap();

        publisher
            .publish_event(EventType::Modified, &breaker("cb-1"), "yard.north")
            .await
            .unwrap();
        publisher
            .publish_event(EventType::Added, &breaker("cb-2"), "plant.south")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::Modified);
        assert_eq!(event.value, breaker("cb-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
