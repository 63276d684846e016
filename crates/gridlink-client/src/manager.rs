// ABOUTME: Application connection manager: transport + login + registration + heartbeat => "fully connected".
// ABOUTME: Owns its tokio runtime, hands out live connections and notifies listeners of every transition.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::application::HeartbeatConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::factory::{ConnectionWatcher, ReconnectingFactory};
use crate::registration::{
    ApplicationProtocol, ApplicationRegistration, BusApplicationProtocol, HeartbeatMonitor,
};
use crate::session::Session;
use crate::settings::{HeartbeatPolicy, Settings, UserSettings};
use crate::transport::Connector;

/// How long a final "offline" heartbeat may take during shutdown.
const OFFLINE_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

/// Observer of the application-level connection.
///
/// Callbacks for one manager never overlap and arrive in order. Do not call
/// `add_connection_listener` or `stop` from inside a callback.
pub trait ApplicationConnectionListener: Send + Sync + 'static {
    fn on_connection_status_changed(&self, connected: bool);

    /// A login, registration or heartbeat problem.
    fn on_connection_error(&self, message: &str) {
        let _ = message;
    }
}

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Transport up; login, registration or first heartbeat pending.
    TransportUp,
    FullyConnected,
    /// `stop()` was called. Terminal.
    ShuttingDown,
}

enum Notice {
    Status { seq: u64, connected: bool },
    Error { seq: u64, message: String },
    Flush(oneshot::Sender<()>),
}

enum TransportEvent {
    Opened(Connection),
    Closed { expected: bool },
}

struct ListenerEntry {
    listener: Arc<dyn ApplicationConnectionListener>,
    /// Sequence number at registration; older notices were covered by the
    /// replay the listener got when it was added.
    since: u64,
}

fn same_listener(
    a: &Arc<dyn ApplicationConnectionListener>,
    b: &Arc<dyn ApplicationConnectionListener>,
) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct Core {
    state: ConnectionState,
    connection: Option<Connection>,
    listeners: Vec<ListenerEntry>,
    seq: u64,
}

struct Shared {
    core: Mutex<Core>,
    /// Held while listener callbacks run, so replays and notices never interleave.
    delivery: Mutex<()>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ConnectionState, connection: Option<Connection>) {
        let mut core = self.core();
        if core.state == ConnectionState::ShuttingDown {
            return;
        }
        let was_connected = core.state == ConnectionState::FullyConnected;
        let now_connected = next == ConnectionState::FullyConnected;
        if core.state != next {
            debug!(from = ?core.state, to = ?next, "Connection state changed");
        }
        core.state = next;
        core.connection = connection;

        if was_connected != now_connected {
            core.seq += 1;
            let seq = core.seq;
            // Sent under the lock so channel order matches sequence order.
            let _ = self.notices.send(Notice::Status {
                seq,
                connected: now_connected,
            });
        }
    }

    fn report_error(&self, message: String) {
        let mut core = self.core();
        core.seq += 1;
        let seq = core.seq;
        let _ = self.notices.send(Notice::Error { seq, message });
    }

    fn state(&self) -> ConnectionState {
        self.core().state
    }

    fn connection(&self) -> Result<Connection, ClientError> {
        let core = self.core();
        match (&core.state, &core.connection) {
            (ConnectionState::FullyConnected, Some(connection)) if connection.is_open() => {
                Ok(connection.clone())
            }
            _ => Err(ClientError::NotConnected(
                "Not connected to the service tier".to_string(),
            )),
        }
    }

    fn add_listener(&self, listener: Arc<dyn ApplicationConnectionListener>) {
        let _delivery = self.delivery();
        let connected = {
            let mut core = self.core();
            core.listeners
                .retain(|entry| !same_listener(&entry.listener, &listener));
            let since = core.seq;
            core.listeners.push(ListenerEntry {
                listener: Arc::clone(&listener),
                since,
            });
            core.state == ConnectionState::FullyConnected
        };
        listener.on_connection_status_changed(connected);
    }

    fn remove_listener(&self, listener: &Arc<dyn ApplicationConnectionListener>) {
        self.core()
            .listeners
            .retain(|entry| !same_listener(&entry.listener, listener));
    }

    fn listeners_after(&self, seq: u64) -> Vec<Arc<dyn ApplicationConnectionListener>> {
        self.core()
            .listeners
            .iter()
            .filter(|entry| entry.since < seq)
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }
}

/// Single task that runs every listener callback.
async fn deliver_notices(shared: Arc<Shared>, mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            Notice::Flush(done) => {
                let _ = done.send(());
            }
            Notice::Status { seq, connected } => {
                let _delivery = shared.delivery();
                for listener in shared.listeners_after(seq) {
                    listener.on_connection_status_changed(connected);
                }
            }
            Notice::Error { seq, message } => {
                let _delivery = shared.delivery();
                for listener in shared.listeners_after(seq) {
                    listener.on_connection_error(&message);
                }
            }
        }
    }
}

/// Forwards factory callbacks into the manager's driver.
struct TransportForwarder(mpsc::UnboundedSender<TransportEvent>);

impl ConnectionWatcher for TransportForwarder {
    fn on_connection_opened(&self, connection: Connection) {
        let _ = self.0.send(TransportEvent::Opened(connection));
    }

    fn on_connection_closed(&self, expected: bool) {
        let _ = self.0.send(TransportEvent::Closed { expected });
    }
}

/// Everything one transport cycle needs.
struct CycleContext {
    shared: Arc<Shared>,
    protocol: Arc<dyn ApplicationProtocol>,
    user: UserSettings,
    registration: ApplicationRegistration,
    policy: HeartbeatPolicy,
}

impl CycleContext {
    async fn establish(
        &self,
        connection: &Connection,
    ) -> Result<(Session, HeartbeatConfig), ClientError> {
        let session = self.protocol.login(connection, &self.user).await?;
        match self.protocol.register(&session, &self.registration).await {
            Ok(heartbeat) => Ok((session, heartbeat)),
            Err(e) => {
                self.release(&session).await;
                Err(e)
            }
        }
    }

    /// Sleep before retrying registration. False if the cycle should end.
    async fn pause(&self, connection: &Connection, cancel: &CancellationToken) -> bool {
        if !connection.is_open() {
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.policy.retry_delay()) => connection.is_open(),
        }
    }

    /// Best-effort revoke of a session the cycle is abandoning, so the
    /// service tier does not keep its token around.
    async fn release(&self, session: &Session) {
        if !session.is_open() {
            return;
        }
        match tokio::time::timeout(OFFLINE_HEARTBEAT_TIMEOUT, self.protocol.logout(session)).await {
            Ok(Ok(())) => debug!("Released application session"),
            Ok(Err(e)) => debug!(error = %e, "Session logout failed"),
            Err(_) => debug!("Session logout timed out"),
        }
    }

    async fn go_offline(&self, session: &Session, heartbeat: &HeartbeatConfig) {
        if !session.is_open() {
            return;
        }
        match tokio::time::timeout(
            OFFLINE_HEARTBEAT_TIMEOUT,
            self.protocol.heartbeat(session, heartbeat, false),
        )
        .await
        {
            Ok(Ok(())) => debug!(process_id = %heartbeat.process_id, "Sent offline heartbeat"),
            Ok(Err(e)) => debug!(error = %e, "Offline heartbeat failed"),
            Err(_) => debug!("Offline heartbeat timed out"),
        }
        self.release(session).await;
    }

    /// Login, register and heartbeat for as long as this transport lives.
    async fn run(self: Arc<Self>, connection: Connection, cancel: CancellationToken) {
        let generation = connection.generation();
        loop {
            let established = tokio::select! {
                _ = cancel.cancelled() => return,
                established = self.establish(&connection) => established,
            };
            let (session, heartbeat) = match established {
                Ok(established) => established,
                Err(e) => {
                    self.shared.report_error(e.to_string());
                    match e {
                        ClientError::Authentication(_)
                        | ClientError::Registration(_)
                        | ClientError::ProtocolViolation(_) => {
                            error!(generation, error = %e, "Application rejected; waiting for next transport cycle");
                            return;
                        }
                        _ => {
                            warn!(generation, error = %e, "Application login failed, retrying");
                            if !self.pause(&connection, &cancel).await {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            let first = tokio::select! {
                _ = cancel.cancelled() => return,
                first = self.protocol.heartbeat(&session, &heartbeat, true) => first,
            };
            if let Err(e) = first {
                warn!(generation, error = %e, "First heartbeat not acknowledged");
                self.shared
                    .report_error(format!("first heartbeat not acknowledged: {e}"));
                self.release(&session).await;
                if !self.pause(&connection, &cancel).await {
                    return;
                }
                continue;
            }

            info!(generation, instance = %heartbeat.instance_name, "Fully connected");
            self.shared
                .transition(ConnectionState::FullyConnected, Some(connection.clone()));

            let mut monitor = HeartbeatMonitor::new(self.policy.max_missed);
            let timeout = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.go_offline(&session, &heartbeat).await;
                        return;
                    }
                    _ = tokio::time::sleep(heartbeat.period()) => {}
                }
                let beat = tokio::select! {
                    _ = cancel.cancelled() => {
                        self.go_offline(&session, &heartbeat).await;
                        return;
                    }
                    beat = self.protocol.heartbeat(&session, &heartbeat, true) => beat,
                };
                match beat {
                    Ok(()) => monitor.acknowledged(),
                    Err(e) => match monitor.missed() {
                        Ok(()) => self.shared.report_error(format!(
                            "heartbeat not acknowledged ({} in a row): {e}",
                            monitor.missed_count()
                        )),
                        Err(timeout) => break timeout,
                    },
                }
            };

            warn!(generation, error = %timeout, "Heartbeat lost, re-registering");
            self.shared.transition(ConnectionState::TransportUp, None);
            self.shared.report_error(timeout.to_string());
            self.release(&session).await;
            if !self.pause(&connection, &cancel).await {
                return;
            }
        }
    }
}

async fn end_cycle(cycle: &mut Option<(CancellationToken, JoinHandle<()>)>) {
    if let Some((cancel, task)) = cycle.take() {
        cancel.cancel();
        let _ = task.await;
    }
}

/// Reacts to transport events: one application cycle per open transport.
async fn drive(
    context: Arc<CycleContext>,
    mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut cycle: Option<(CancellationToken, JoinHandle<()>)> = None;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = transport.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::Opened(connection) => {
                end_cycle(&mut cycle).await;
                context
                    .shared
                    .transition(ConnectionState::TransportUp, None);
                let token = cancel.child_token();
                let task = tokio::spawn(Arc::clone(&context).run(connection, token.clone()));
                cycle = Some((token, task));
            }
            TransportEvent::Closed { expected } => {
                end_cycle(&mut cycle).await;
                debug!(expected, "Transport closed");
                context
                    .shared
                    .transition(ConnectionState::Disconnected, None);
            }
        }
    }
    end_cycle(&mut cycle).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// Turns "transport up" plus "heartbeat acknowledged" into one connected
/// flag, and hands out the live [`Connection`] while it holds.
///
/// The manager owns a multi-threaded runtime for its own work. `start`,
/// `stop` and the accessors are plain blocking calls; `stop` must not be
/// called from inside an async context.
pub struct ApplicationConnectionManager {
    runtime: Mutex<Option<Runtime>>,
    shared: Arc<Shared>,
    factory: ReconnectingFactory,
    context: Arc<CycleContext>,
    transport: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ApplicationConnectionManager {
    /// Manager speaking the bus login/registration/heartbeat protocol.
    pub fn new(settings: &Settings, connector: Arc<dyn Connector>) -> Result<Self, ClientError> {
        Self::with_protocol(settings, connector, Arc::new(BusApplicationProtocol))
    }

    pub fn with_protocol(
        settings: &Settings,
        connector: Arc<dyn Connector>,
        protocol: Arc<dyn ApplicationProtocol>,
    ) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gridlink-manager")
            .enable_all()
            .build()
            .map_err(|e| ClientError::Runtime(e.to_string()))?;

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                connection: None,
                listeners: Vec::new(),
                seq: 0,
            }),
            delivery: Mutex::new(()),
            notices: notice_tx,
        });
        runtime.spawn(deliver_notices(Arc::clone(&shared), notice_rx));

        let factory = ReconnectingFactory::new(
            connector,
            settings.reconnect,
            settings.requests.timeout(),
            runtime.handle().clone(),
        );
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        factory.add_connection_watcher(Arc::new(TransportForwarder(transport_tx)));

        let context = Arc::new(CycleContext {
            shared: Arc::clone(&shared),
            protocol,
            user: settings.user.clone(),
            registration: ApplicationRegistration::from_settings(settings),
            policy: settings.heartbeat,
        });

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            shared,
            factory,
            context,
            transport: Mutex::new(Some(transport_rx)),
            lifecycle: Mutex::new(Lifecycle::Created),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin connecting. Fails if called twice or after `stop`.
    pub fn start(&self) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Started => {
                return Err(ClientError::IllegalState(
                    "connection manager already started".to_string(),
                ))
            }
            Lifecycle::Stopped => {
                return Err(ClientError::IllegalState(
                    "connection manager has been stopped".to_string(),
                ))
            }
            Lifecycle::Created => {}
        }

        let handle = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| ClientError::IllegalState("runtime already shut down".to_string()))?;
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ClientError::IllegalState("manager already driven".to_string()))?;

        self.tasks.spawn_on(
            drive(Arc::clone(&self.context), transport, self.cancel.clone()),
            &handle,
        );
        self.factory.start()?;
        *lifecycle = Lifecycle::Started;
        info!(
            instance = %self.context.registration.instance_name,
            user = %self.context.user.name,
            "Application connection manager started"
        );
        Ok(())
    }

    /// Tear everything down and wait for it. Listeners see `false` if the
    /// manager was connected. Idempotent; there is no restart.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        info!("Stopping application connection manager");
        self.shared.transition(ConnectionState::ShuttingDown, None);

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        runtime.block_on(async {
            self.cancel.cancel();
            self.tasks.close();
            self.tasks.wait().await;
            self.factory.stop().await;

            let (done_tx, done_rx) = oneshot::channel();
            if self.shared.notices.send(Notice::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        });
        runtime.shutdown_timeout(Duration::from_secs(1));
        info!("Application connection manager stopped");
    }

    /// True while logged in, registered and heartbeating.
    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::FullyConnected
    }

    pub fn is_shutdown(&self) -> bool {
        *self.lifecycle() == Lifecycle::Stopped
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The live connection, or `NotConnected`.
    pub fn get_connection(&self) -> Result<Connection, ClientError> {
        self.shared.connection()
    }

    /// Register a listener and immediately tell it the current status, on
    /// the calling thread. Adding a listener twice keeps one registration.
    pub fn add_connection_listener(&self, listener: Arc<dyn ApplicationConnectionListener>) {
        self.shared.add_listener(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ApplicationConnectionListener>) {
        self.shared.remove_listener(listener);
    }
}

impl Drop for ApplicationConnectionManager {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            self.cancel.cancel();
            runtime.shutdown_background();
        }
    }
}
