// ABOUTME: Reconnect-until-success loop around a transport connector with exponential backoff.
// ABOUTME: Notifies connection watchers on every open and close; stop() is terminal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::ClientError;
use crate::settings::ReconnectPolicy;
use crate::transport::Connector;

/// Transport-level lifecycle callbacks.
///
/// Called from the factory's retry task, one at a time and in order.
/// Implementations should return quickly.
pub trait ConnectionWatcher: Send + Sync + 'static {
    fn on_connection_opened(&self, connection: Connection);

    /// `expected` is true when the close came from `stop()`.
    fn on_connection_closed(&self, expected: bool);
}

type Watchers = Arc<Mutex<Vec<Arc<dyn ConnectionWatcher>>>>;

fn same_watcher(a: &Arc<dyn ConnectionWatcher>, b: &Arc<dyn ConnectionWatcher>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn lock_watchers(watchers: &Watchers) -> MutexGuard<'_, Vec<Arc<dyn ConnectionWatcher>>> {
    watchers.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Keeps one transport connection alive for as long as it runs.
pub struct ReconnectingFactory {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    request_timeout: Duration,
    handle: Handle,
    watchers: Watchers,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ReconnectingFactory {
    /// The retry loop runs on `handle`. `request_timeout` is the default for
    /// requests on the connections it opens.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        request_timeout: Duration,
        handle: Handle,
    ) -> Self {
        Self {
            connector,
            policy,
            request_timeout,
            handle,
            watchers: Arc::new(Mutex::new(Vec::new())),
            lifecycle: Mutex::new(Lifecycle::Idle),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a watcher. Adding the same watcher again moves it to the end.
    /// A watcher added while connected hears about the next transition only.
    pub fn add_connection_watcher(&self, watcher: Arc<dyn ConnectionWatcher>) {
        let mut watchers = lock_watchers(&self.watchers);
        watchers.retain(|w| !same_watcher(w, &watcher));
        watchers.push(watcher);
    }

    pub fn remove_connection_watcher(&self, watcher: &Arc<dyn ConnectionWatcher>) {
        lock_watchers(&self.watchers).retain(|w| !same_watcher(w, watcher));
    }

    /// Begin connecting. Fails if already started or stopped.
    pub fn start(&self) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Running => {
                return Err(ClientError::IllegalState(
                    "connection factory already started".to_string(),
                ))
            }
            Lifecycle::Stopped => {
                return Err(ClientError::IllegalState(
                    "connection factory was stopped".to_string(),
                ))
            }
            Lifecycle::Idle => *lifecycle = Lifecycle::Running,
        }

        let retry = RetryLoop {
            connector: Arc::clone(&self.connector),
            policy: self.policy,
            request_timeout: self.request_timeout,
            watchers: Arc::clone(&self.watchers),
            cancel: self.cancel.clone(),
        };
        self.tasks.spawn_on(retry.run(), &self.handle);
        Ok(())
    }

    /// Cancel any attempt in flight, close the live connection (watchers see
    /// an expected close) and wait for the retry loop to exit. Terminal.
    pub async fn stop(&self) {
        *self.lifecycle() = Lifecycle::Stopped;
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.lifecycle() == Lifecycle::Stopped
    }
}

struct RetryLoop {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    request_timeout: Duration,
    watchers: Watchers,
    cancel: CancellationToken,
}

impl RetryLoop {
    fn notify(&self, event: impl Fn(&dyn ConnectionWatcher)) {
        let snapshot: Vec<Arc<dyn ConnectionWatcher>> = lock_watchers(&self.watchers).clone();
        for watcher in snapshot {
            event(watcher.as_ref());
        }
    }

    /// Sleep for `delay` unless cancelled first. Returns false on cancel.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(self) {
        info!(broker = %self.connector.describe(), "Connection factory started");
        let mut delay = self.policy.start_delay();
        let mut generation: u64 = 0;

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.connector.connect() => attempt,
            };

            let broker = match attempt {
                Ok(broker) => broker,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection attempt failed"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                    delay = self.policy.next_delay(delay);
                    continue;
                }
            };

            generation += 1;
            let connection =
                match Connection::open(Arc::clone(&broker), generation, self.request_timeout).await
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, generation, "Connection setup failed");
                        broker.disconnect().await;
                        if !self.pause(delay).await {
                            break;
                        }
                        delay = self.policy.next_delay(delay);
                        continue;
                    }
                };

            delay = self.policy.start_delay();
            info!(generation, "Transport connected");
            self.notify(|w| w.on_connection_opened(connection.clone()));

            let expected = tokio::select! {
                _ = self.cancel.cancelled() => {
                    connection.disconnect().await;
                    true
                }
                expected = broker.closed() => expected,
            };
            connection.invalidate("transport closed");
            if expected {
                info!(generation, "Transport closed");
            } else {
                warn!(generation, "Transport lost, reconnecting");
            }
            self.notify(|w| w.on_connection_closed(expected));

            if self.cancel.is_cancelled() {
                break;
            }
        }

        debug!("Connection factory loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::transport::BrokerConnection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Opened(u64),
        Closed(bool),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    impl ConnectionWatcher for Recorder {
        fn on_connection_opened(&self, connection: Connection) {
            let _ = self.0.send(Seen::Opened(connection.generation()));
        }

        fn on_connection_closed(&self, expected: bool) {
            let _ = self.0.send(Seen::Closed(expected));
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    fn factory(connector: Arc<dyn Connector>) -> (ReconnectingFactory, mpsc::UnboundedReceiver<Seen>) {
        let factory = ReconnectingFactory::new(
            connector,
            fast_policy(),
            Duration::from_secs(1),
            Handle::current(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        factory.add_connection_watcher(Arc::new(Recorder(tx)));
        (factory, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watcher notification")
            .expect("watcher channel open")
    }

    /// Fails the first `failures` attempts, then delegates.
    struct Flaky {
        inner: Arc<dyn Connector>,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Flaky {
        async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ClientError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(ClientError::Transport("refused".into()));
            }
            self.inner.connect().await
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_loss() {
        let broker = MemoryBroker::new();
        let (factory, mut rx) = factory(Arc::new(broker.connector()));
        factory.start().unwrap();

        assert_eq!(next(&mut rx).await, Seen::Opened(1));
        broker.sever_connections();
        assert_eq!(next(&mut rx).await, Seen::Closed(false));
        assert_eq!(next(&mut rx).await, Seen::Opened(2));

        factory.stop().await;
        assert_eq!(next(&mut rx).await, Seen::Closed(true));
    }

    #[tokio::test]
    async fn test_retries_until_broker_available() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (factory, mut rx) = factory(Arc::new(broker.connector()));
        factory.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        broker.set_available(true);
        assert_eq!(next(&mut rx).await, Seen::Opened(1));
        factory.stop().await;
    }

    #[tokio::test]
    async fn test_failed_attempts_are_retried() {
        let broker = MemoryBroker::new();
        let flaky = Arc::new(Flaky {
            inner: Arc::new(broker.connector()),
            failures: 3,
            attempts: AtomicUsize::new(0),
        });
        let (factory, mut rx) = factory(flaky.clone());
        factory.start().unwrap();

        assert_eq!(next(&mut rx).await, Seen::Opened(1));
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);
        factory.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_and_restart_are_illegal() {
        let broker = MemoryBroker::new();
        let (factory, _rx) = factory(Arc::new(broker.connector()));
        factory.start().unwrap();
        assert!(matches!(factory.start(), Err(ClientError::IllegalState(_))));

        factory.stop().await;
        assert!(factory.is_stopped());
        assert!(matches!(factory.start(), Err(ClientError::IllegalState(_))));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_connect_sends_no_close() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (factory, mut rx) = factory(Arc::new(broker.connector()));
        factory.start().unwrap();
        factory.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removed_watcher_is_not_notified() {
        let broker = MemoryBroker::new();
        let factory = ReconnectingFactory::new(
            Arc::new(broker.connector()),
            fast_policy(),
            Duration::from_secs(1),
            Handle::current(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher: Arc<dyn ConnectionWatcher> = Arc::new(Recorder(tx));
        factory.add_connection_watcher(Arc::clone(&watcher));
        factory.add_connection_watcher(Arc::clone(&watcher));
        factory.remove_connection_watcher(&watcher);

        factory.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        factory.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_watcher_notified_once() {
        let broker = MemoryBroker::new();
        let (factory, mut rx) = factory(Arc::new(broker.connector()));
        let (tx, mut dup_rx) = mpsc::unbounded_channel();
        let watcher: Arc<dyn ConnectionWatcher> = Arc::new(Recorder(tx));
        factory.add_connection_watcher(Arc::clone(&watcher));
        factory.add_connection_watcher(watcher);

        factory.start().unwrap();
        assert_eq!(next(&mut rx).await, Seen::Opened(1));
        assert_eq!(next(&mut dup_rx).await, Seen::Opened(1));
        factory.stop().await;
        assert_eq!(next(&mut dup_rx).await, Seen::Closed(true));
        assert!(dup_rx.try_recv().is_err());
    }
}
