// ABOUTME: End-to-end tests for the local service tier.
// ABOUTME: A real application manager logs in, registers, heartbeats and relays commands through it.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridlink_client::settings::{ReconnectPolicy, UserSettings};
use gridlink_client::{
    ApplicationConfig, ApplicationConnectionListener, ApplicationConnectionManager, ClientError, CommandExecution,
    CommandRequest, CommandRequestHandler, CommandService, CommandStatus, CommandValue,
    Connection, MemoryBroker, Routing, Settings,
};
use gridlink_serve::{AcceptAllAdapter, LocalServiceTier, Registry};
use tokio::runtime::Runtime;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

enum Heard {
    Status(bool),
    Error(String),
}

struct Channel(Mutex<mpsc::Sender<Heard>>);

impl ApplicationConnectionListener for Channel {
    fn on_connection_status_changed(&self, connected: bool) {
        let _ = self.0.lock().unwrap().send(Heard::Status(connected));
    }

    fn on_connection_error(&self, message: &str) {
        let _ = self.0.lock().unwrap().send(Heard::Error(message.to_string()));
    }
}

fn listen(manager: &ApplicationConnectionManager) -> mpsc::Receiver<Heard> {
    let (tx, rx) = mpsc::channel();
    manager.add_connection_listener(Arc::new(Channel(Mutex::new(tx))));
    rx
}

fn wait_for_status(rx: &mpsc::Receiver<Heard>, wanted: bool) {
    loop {
        match rx.recv_timeout(WAIT).expect("status change") {
            Heard::Status(connected) if connected == wanted => return,
            _ => continue,
        }
    }
}

fn settings(password: &str) -> Settings {
    let mut settings = Settings::default();
    settings.user = UserSettings::new("operator", password);
    settings.application.instance_name = "hmi-test".into();
    settings.reconnect = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(100));
    settings.heartbeat.retry_delay_ms = 50;
    settings.requests.timeout_ms = 1000;
    settings
}

/// Tier on its own runtime, sharing `broker` with the application.
fn start_tier(rt: &Runtime, broker: &MemoryBroker) -> (Connection, LocalServiceTier) {
    rt.block_on(async {
        let connection = Connection::establish(&broker.connector(), Duration::from_secs(1))
            .await
            .unwrap();
        let registry = Registry::new(
            [("operator".to_string(), "secret".to_string())],
            Duration::from_millis(50),
        );
        let tier = LocalServiceTier::start(&connection, registry, Routing::AnyNode)
            .await
            .unwrap();
        (connection, tier)
    })
}

// ============================================================================
// Connectivity
// ============================================================================

#[test]
fn test_application_becomes_fully_connected_and_goes_offline_on_stop() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (_tier_connection, tier) = start_tier(&rt, &broker);

    let manager =
        ApplicationConnectionManager::new(&settings("secret"), Arc::new(broker.connector()))
            .unwrap();
    let rx = listen(&manager);
    wait_for_status(&rx, false);
    manager.start().unwrap();
    wait_for_status(&rx, true);

    assert!(manager.get_connection().unwrap().is_open());
    let applications = tier.registry().applications();
    assert_eq!(applications.len(), 1);
    let record = &applications[0];
    assert_eq!(record.config.instance_name, "hmi-test");
    assert_eq!(record.config.user_name, "operator");
    assert!(record.online);
    assert_eq!(tier.registry().token_count(), 1);

    manager.stop();
    wait_for_status(&rx, false);
    let record = tier.registry().application(record.process_id()).unwrap();
    assert!(!record.online);
    // The manager logged its session out on the way down.
    assert_eq!(tier.registry().token_count(), 0);
    assert!(matches!(
        manager.get_connection(),
        Err(ClientError::NotConnected(_))
    ));
}

#[test]
fn test_wrong_password_is_reported_and_never_connects() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (_tier_connection, tier) = start_tier(&rt, &broker);

    let manager =
        ApplicationConnectionManager::new(&settings("wrong"), Arc::new(broker.connector()))
            .unwrap();
    let rx = listen(&manager);
    manager.start().unwrap();

    let message = loop {
        match rx.recv_timeout(WAIT).expect("error report") {
            Heard::Error(message) => break message,
            Heard::Status(connected) => assert!(!connected),
        }
    };
    assert!(message.contains("authentication failed"));
    assert!(!manager.is_connected());
    assert!(tier.registry().applications().is_empty());
    manager.stop();
}

#[test]
fn test_application_recovers_after_bus_outage() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (_tier_connection, tier) = start_tier(&rt, &broker);

    let manager =
        ApplicationConnectionManager::new(&settings("secret"), Arc::new(broker.connector()))
            .unwrap();
    let rx = listen(&manager);
    manager.start().unwrap();
    wait_for_status(&rx, true);

    // The outage also takes down the tier's own connection; bring it back
    // on a fresh one before the application retries.
    broker.set_available(false);
    wait_for_status(&rx, false);
    tier.stop();
    broker.set_available(true);
    let (_tier_connection, _tier) = start_tier(&rt, &broker);

    wait_for_status(&rx, true);
    assert!(manager.is_connected());
    manager.stop();
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_user_command_relayed_to_adapter() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (tier_connection, _tier) = start_tier(&rt, &broker);
    rt.block_on(
        tier_connection.service_registration().bind_command_handler(
            Arc::new(AcceptAllAdapter),
            Routing::AnyNode,
            true,
            Duration::from_millis(500),
        ),
    )
    .unwrap();

    let settings = settings("secret");
    let manager =
        ApplicationConnectionManager::new(&settings, Arc::new(broker.connector())).unwrap();
    let rx = listen(&manager);
    manager.start().unwrap();
    wait_for_status(&rx, true);

    let connection = manager.get_connection().unwrap();
    let session = rt.block_on(connection.login(&settings.user)).unwrap();
    let commands = CommandService::new(session);
    let status = commands
        .execute("breaker.open", CommandValue::None, Duration::from_millis(500))
        .await_result()
        .unwrap();
    assert_eq!(status, CommandStatus::Success);
    manager.stop();
}

/// Never answers; the adapter-side tracker times the command out.
struct SilentAdapter;

impl CommandRequestHandler for SilentAdapter {
    fn handle_command_request(&self, _request: CommandRequest, _execution: CommandExecution) {}
}

#[test]
fn test_unanswered_command_times_out() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (tier_connection, _tier) = start_tier(&rt, &broker);
    rt.block_on(
        tier_connection.service_registration().bind_command_handler(
            Arc::new(SilentAdapter),
            Routing::AnyNode,
            true,
            Duration::from_millis(100),
        ),
    )
    .unwrap();

    let client = rt
        .block_on(Connection::establish(&broker.connector(), Duration::from_secs(1)))
        .unwrap();
    let session = rt
        .block_on(client.login(&UserSettings::new("operator", "secret")))
        .unwrap();
    let status = CommandService::new(session)
        .execute("breaker.close", CommandValue::None, Duration::from_millis(300))
        .await_result()
        .unwrap();
    assert_eq!(status, CommandStatus::Timeout);
}

#[test]
fn test_commands_require_login() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (_tier_connection, _tier) = start_tier(&rt, &broker);

    let client = rt
        .block_on(Connection::establish(&broker.connector(), Duration::from_secs(1)))
        .unwrap();
    let err = CommandService::new(client.anonymous_session())
        .execute("breaker.open", CommandValue::None, Duration::from_millis(200))
        .await_result()
        .unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized(_)));
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn test_batched_requests_run_through_the_tier_in_order() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (_tier_connection, tier) = start_tier(&rt, &broker);

    let client = rt
        .block_on(Connection::establish(&broker.connector(), Duration::from_secs(1)))
        .unwrap();
    let session = rt
        .block_on(client.login(&UserSettings::new("operator", "secret")))
        .unwrap();

    let batching = session.batching();
    batching.start().unwrap();
    let registered = session
        .put(&ApplicationConfig {
            instance_name: "batched-hmi".into(),
            user_name: String::new(),
            capabilities: vec!["hmi".into()],
            node_name: "node-1".into(),
            location: None,
            network: None,
            heartbeat: None,
        })
        .one();
    let listed = session.get(&ApplicationConfig::default()).many();
    assert!(!registered.is_complete());
    assert!(tier.registry().applications().is_empty());

    let reply = batching.flush().await_result().unwrap();
    assert_eq!(reply.requests.len(), 2);

    let registered = registered.await_result().unwrap();
    assert_eq!(registered.user_name, "operator");
    assert!(registered.heartbeat.is_some());
    // The second entry ran after the first one registered.
    let listed = listed.await_result().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].instance_name, "batched-hmi");
}

#[test]
fn test_batched_entries_authenticate_individually() {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (_tier_connection, _tier) = start_tier(&rt, &broker);

    let client = rt
        .block_on(Connection::establish(&broker.connector(), Duration::from_secs(1)))
        .unwrap();
    let session = client.anonymous_session();
    let batching = session.batching();
    batching.start().unwrap();
    let listed = session.get(&ApplicationConfig::default()).many();

    assert!(batching.flush_chunked(1).await_result().unwrap());
    assert!(matches!(
        listed.await_result(),
        Err(ClientError::Unauthorized(_))
    ));
}
