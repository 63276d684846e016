// ABOUTME: Push delivery of typed subscription events from a private bus queue.
// ABOUTME: Buffers events until an acceptor is attached; cancel stops delivery and releases the queue.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{EventEnvelope, EventType};
use crate::error::ClientError;
use crate::transport::{BrokerConnection, BusMessage, Delivery};

/// Events held for a subscription that has not been started yet.
pub const DEFAULT_PREBUFFER: usize = 1024;

/// One change pushed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent<T> {
    pub event_type: EventType,
    pub value: T,
}

/// Receives subscription events. Calls for one subscription never overlap
/// and arrive in bus order.
pub trait SubscriptionEventAcceptor<T>: Send + 'static {
    fn on_event(&mut self, event: SubscriptionEvent<T>);
}

impl<T, F> SubscriptionEventAcceptor<T> for F
where
    F: FnMut(SubscriptionEvent<T>) + Send + 'static,
{
    fn on_event(&mut self, event: SubscriptionEvent<T>) {
        self(event)
    }
}

struct DeliveryState<T> {
    started: bool,
    // Empty while a delivery is in flight; the acceptor runs unlocked.
    acceptor: Option<Box<dyn SubscriptionEventAcceptor<T>>>,
    buffer: VecDeque<SubscriptionEvent<T>>,
    dropped: usize,
}

struct Inner<T> {
    id: String,
    cancel: CancellationToken,
    prebuffer: usize,
    state: Mutex<DeliveryState<T>>,
}

impl<T: 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, DeliveryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: SubscriptionEvent<T>) {
        let mut acceptor = {
            let mut state = self.lock();
            if self.cancel.is_cancelled() {
                return;
            }
            match state.acceptor.take() {
                Some(acceptor) => acceptor,
                None => {
                    // Started subscriptions only land here while `start` is
                    // replaying; those events must not be lost.
                    if state.started || state.buffer.len() < self.prebuffer {
                        state.buffer.push_back(event);
                    } else {
                        state.dropped += 1;
                        warn!(
                            subscription = %self.id,
                            dropped = state.dropped,
                            "Subscription not started, buffer full; dropping event"
                        );
                    }
                    return;
                }
            }
        };

        acceptor.on_event(event);
        self.restore(acceptor);
    }

    /// Put the acceptor back after an unlocked delivery, unless the
    /// subscription died meanwhile.
    fn restore(&self, acceptor: Box<dyn SubscriptionEventAcceptor<T>>) {
        let mut state = self.lock();
        if !self.cancel.is_cancelled() {
            state.acceptor = Some(acceptor);
            return;
        }
        drop(state);
        drop(acceptor);
    }
}

/// Type-erased handle to a subscription, for code that manages
/// subscriptions without knowing their event types.
#[derive(Debug, Clone)]
pub struct SubscriptionBinding {
    id: String,
    cancel: CancellationToken,
}

impl SubscriptionBinding {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Same as [`Subscription::cancel`].
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(subscription = %self.id, "Cancelling subscription");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A cancelable stream of typed events. Clones refer to the same
/// subscription.
pub struct Subscription<T> {
    inner: Arc<Inner<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Start pumping `delivery` into a new subscription. `cancel` should be a
    /// child of the owning connection's liveness token.
    pub(crate) fn spawn(
        handle: &Handle,
        broker: Arc<dyn BrokerConnection>,
        delivery: Delivery,
        cancel: CancellationToken,
        prebuffer: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            id: delivery.queue.clone(),
            cancel,
            prebuffer,
            state: Mutex::new(DeliveryState {
                started: false,
                acceptor: None,
                buffer: VecDeque::new(),
                dropped: 0,
            }),
        });
        handle.spawn(pump(Arc::clone(&inner), broker, delivery));
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Subscription<T> {
    /// Stable identifier; also the name of the bus queue events arrive on.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Attach the delivery target. Buffered events are replayed first, in
    /// order. Fails if already started or cancelled.
    pub fn start<A>(&self, acceptor: A) -> Result<(), ClientError>
    where
        A: SubscriptionEventAcceptor<T>,
    {
        let mut pending = {
            let mut state = self.inner.lock();
            if self.inner.cancel.is_cancelled() {
                return Err(ClientError::IllegalState(format!(
                    "subscription {} is cancelled",
                    self.inner.id
                )));
            }
            if state.started {
                return Err(ClientError::IllegalState(format!(
                    "subscription {} already started",
                    self.inner.id
                )));
            }
            state.started = true;
            std::mem::take(&mut state.buffer)
        };

        // Replay without the lock; events the pump receives meanwhile queue
        // up behind the replay and are drained before the acceptor is
        // installed.
        let mut acceptor: Box<dyn SubscriptionEventAcceptor<T>> = Box::new(acceptor);
        loop {
            while let Some(event) = pending.pop_front() {
                if self.inner.cancel.is_cancelled() {
                    return Ok(());
                }
                acceptor.on_event(event);
            }
            let mut state = self.inner.lock();
            if state.buffer.is_empty() {
                if self.inner.cancel.is_cancelled() {
                    drop(state);
                    return Ok(());
                }
                state.acceptor = Some(acceptor);
                return Ok(());
            }
            pending = std::mem::take(&mut state.buffer);
        }
    }

    /// Stop delivery. A delivery already in progress finishes; nothing after
    /// it is delivered. Safe to call repeatedly. Every method, this one
    /// included, may be called from inside the acceptor.
    pub fn cancel(&self) {
        self.binding().cancel();
    }

    pub fn binding(&self) -> SubscriptionBinding {
        SubscriptionBinding {
            id: self.inner.id.clone(),
            cancel: self.inner.cancel.clone(),
        }
    }

    /// True after `cancel` or once the underlying connection is gone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }
}

fn decode<T: DeserializeOwned>(message: &BusMessage) -> Result<SubscriptionEvent<T>, ClientError> {
    let envelope: EventEnvelope = serde_json::from_slice(&message.payload)?;
    Ok(SubscriptionEvent {
        event_type: envelope.event_type,
        value: serde_json::from_value(envelope.payload)?,
    })
}

async fn pump<T: DeserializeOwned + 'static>(
    inner: Arc<Inner<T>>,
    broker: Arc<dyn BrokerConnection>,
    mut delivery: Delivery,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            message = delivery.messages.recv() => message,
        };
        let Some(message) = message else {
            debug!(subscription = %inner.id, "Subscription queue closed");
            break;
        };
        match decode::<T>(&message) {
            Ok(event) => inner.dispatch(event),
            Err(e) => warn!(subscription = %inner.id, error = %e, "Dropping undecodable event"),
        }
    }

    // A closed queue means the transport is gone; the subscription is dead.
    inner.cancel.cancel();
    let (acceptor, buffer) = {
        let mut state = inner.lock();
        (state.acceptor.take(), std::mem::take(&mut state.buffer))
    };
    drop(acceptor);
    drop(buffer);
    if broker.is_open() {
        if let Err(e) = broker
            .cancel_consumer(&delivery.queue, delivery.consumer_tag)
            .await
        {
            debug!(subscription = %inner.id, error = %e, "Failed to cancel subscription consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::transport::{Connector, Destination, QueueSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn setup() -> (MemoryBroker, Arc<dyn BrokerConnection>, Subscription<u32>) {
        let broker = MemoryBroker::new();
        let conn = broker.connector().connect().await.unwrap();
        let delivery = conn.consume(QueueSpec::Private).await.unwrap();
        conn.bind_queue(&delivery.queue, "counter.events", "#")
            .await
            .unwrap();
        let sub = Subscription::spawn(
            &Handle::current(),
            Arc::clone(&conn),
            delivery,
            CancellationToken::new(),
            DEFAULT_PREBUFFER,
        );
        (broker, conn, sub)
    }

    async fn publish(conn: &Arc<dyn BrokerConnection>, value: u32) {
        let envelope = EventEnvelope {
            event_type: EventType::Modified,
            payload: serde_json::json!(value),
        };
        conn.publish(
            &Destination::new("counter.events", "counter"),
            BusMessage::new(serde_json::to_vec(&envelope).unwrap()),
        )
        .await
        .unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (_broker, conn, sub) = setup().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sub.start(move |event: SubscriptionEvent<u32>| {
            let _ = tx.send(event.value);
        })
        .unwrap();

        for v in 1..=5 {
            publish(&conn, v).await;
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_cancel_inside_acceptor_stops_remaining_events() {
        let (_broker, conn, sub) = setup().await;
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = sub.clone();
        sub.start(move |_event: SubscriptionEvent<u32>| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                handle.cancel();
            }
        })
        .unwrap();

        for v in 1..=5 {
            publish(&conn, v).await;
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(sub.is_cancelled());
    }

    #[tokio::test]
    async fn test_acceptor_may_query_and_cancel_its_subscription() {
        let (_broker, conn, sub) = setup().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = sub.clone();
        sub.start(move |event: SubscriptionEvent<u32>| {
            let _ = tx.send((event.value, handle.is_started(), handle.id().to_string()));
            handle.cancel();
        })
        .unwrap();

        publish(&conn, 7).await;
        publish(&conn, 8).await;
        let (value, started, id) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("acceptor never ran")
            .unwrap();
        assert_eq!(value, 7);
        assert!(started);
        assert_eq!(id, sub.id());

        settle().await;
        assert!(sub.is_cancelled());
        assert!(sub.is_started());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replayed_acceptor_may_query_its_subscription() {
        let (_broker, conn, sub) = setup().await;
        publish(&conn, 1).await;
        publish(&conn, 2).await;
        settle().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = sub.clone();
        sub.start(move |event: SubscriptionEvent<u32>| {
            let _ = tx.send((event.value, handle.is_started()));
        })
        .unwrap();
        publish(&conn, 3).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .expect("acceptor never ran")
                    .unwrap(),
            );
        }
        assert_eq!(seen, vec![(1, true), (2, true), (3, true)]);
    }

    #[tokio::test]
    async fn test_events_before_start_are_buffered() {
        let (_broker, conn, sub) = setup().await;
        publish(&conn, 10).await;
        publish(&conn, 11).await;
        settle().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sub.start(move |event: SubscriptionEvent<u32>| {
            let _ = tx.send(event);
        })
        .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.value, 10);
        assert_eq!(first.event_type, EventType::Modified);
        assert_eq!(rx.recv().await.unwrap().value, 11);
    }

    #[tokio::test]
    async fn test_start_twice_is_illegal() {
        let (_broker, _conn, sub) = setup().await;
        sub.start(|_: SubscriptionEvent<u32>| {}).unwrap();
        let err = sub.start(|_: SubscriptionEvent<u32>| {}).unwrap_err();
        assert!(matches!(err, ClientError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_releases_queue() {
        let (broker, _conn, sub) = setup().await;
        assert!(broker.has_queue(sub.id()));
        sub.cancel();
        sub.cancel();
        settle().await;
        assert!(!broker.has_queue(sub.id()));
        assert!(sub.start(|_: SubscriptionEvent<u32>| {}).is_err());
    }

    #[tokio::test]
    async fn test_binding_cancels_the_subscription() {
        let (broker, _conn, sub) = setup().await;
        let binding = sub.binding();
        assert_eq!(binding.id(), sub.id());
        assert!(!binding.is_cancelled());

        binding.cancel();
        assert!(sub.is_cancelled());
        settle().await;
        assert!(!broker.has_queue(sub.id()));
    }

    #[tokio::test]
    async fn test_transport_loss_cancels_subscription() {
        let (broker, _conn, sub) = setup().await;
        broker.sever_connections();
        settle().await;
        assert!(sub.is_cancelled());
    }
}
