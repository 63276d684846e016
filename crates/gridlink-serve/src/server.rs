// ABOUTME: Local service tier wiring and process lifecycle
// ABOUTME: Binds every service on one connection, then runs an application manager against it until shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use gridlink_client::{
    ApplicationConfig, ApplicationConnectionListener, ApplicationConnectionManager, AuthToken,
    BatchServiceRequest, ClientError, CommandDispatcher, CommandExecution, CommandRequest, CommandRequestHandler,
    CommandStatus, Connection, MemoryBroker, Routing, ServiceBinding, ServiceType, StatusSnapshot,
    UserCommandRequest,
};
use tokio::signal;
use tracing::{error, info, warn};

use crate::registry::{Registry, HEARTBEAT_ROUTING_KEY};
use crate::services::{
    ApplicationService, AuthService, BatchService, CommandRelay, StatusService,
};
use crate::ServeConfig;

/// The services a gridlink application needs to become fully connected,
/// plus request batching and the user command relay.
pub struct LocalServiceTier {
    registry: Arc<Registry>,
    dispatcher: CommandDispatcher,
    bindings: Vec<ServiceBinding>,
}

impl LocalServiceTier {
    /// Bind all services on `connection`. Commands are relayed to adapters
    /// bound under `adapters`.
    pub async fn start(
        connection: &Connection,
        registry: Arc<Registry>,
        adapters: Routing,
    ) -> Result<Self, ClientError> {
        let registration = connection.service_registration();
        let dispatcher = CommandDispatcher::new(connection.clone());

        let (auth, applications, heartbeats, batches, commands) = futures::try_join!(
            registration.bind_service::<AuthToken>(
                Arc::new(AuthService::new(Arc::clone(&registry))),
                Routing::AnyNode,
                true,
            ),
            registration.bind_service::<ApplicationConfig>(
                Arc::new(ApplicationService::new(Arc::clone(&registry))),
                Routing::AnyNode,
                true,
            ),
            registration.bind_service::<StatusSnapshot>(
                Arc::new(StatusService::new(Arc::clone(&registry))),
                Routing::address(HEARTBEAT_ROUTING_KEY),
                true,
            ),
            registration.bind_service::<BatchServiceRequest>(
                Arc::new(BatchService::new(connection.clone())),
                Routing::AnyNode,
                true,
            ),
            registration.bind_service::<UserCommandRequest>(
                Arc::new(CommandRelay::new(
                    Arc::clone(&registry),
                    dispatcher.clone(),
                    adapters,
                )),
                Routing::AnyNode,
                true,
            ),
        )?;
        let bindings = vec![auth, applications, heartbeats, batches, commands];

        info!(services = bindings.len(), "Local service tier bound");
        Ok(Self {
            registry,
            dispatcher,
            bindings,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Unbind every service. Requests in flight still get answers.
    pub fn stop(&self) {
        for binding in &self.bindings {
            binding.cancel();
        }
        info!("Local service tier unbound");
    }
}

/// Adapter that accepts every command.
pub struct AcceptAllAdapter;

impl CommandRequestHandler for AcceptAllAdapter {
    fn handle_command_request(&self, request: CommandRequest, execution: CommandExecution) {
        info!(
            command = %request.name,
            correlation_id = %execution.correlation_id(),
            user = execution.user().unwrap_or("-"),
            "Executing command"
        );
        if let Err(e) = execution.set_command_result(CommandStatus::Success) {
            warn!(error = %e, "Command result rejected");
        }
    }
}

/// Logs connectivity of the tier's own application session.
struct LogListener;

impl ApplicationConnectionListener for LogListener {
    fn on_connection_status_changed(&self, connected: bool) {
        info!(connected, "Application connection status");
    }

    fn on_connection_error(&self, message: &str) {
        warn!(%message, "Application connection error");
    }
}

/// Run the local service tier until Ctrl+C or SIGTERM.
pub async fn run(config: ServeConfig) -> Result<()> {
    let settings = config.settings;
    info!("Starting local service tier");
    info!("  Broker: {}", settings.broker);
    info!("  Heartbeat period: {:?}", config.heartbeat_period);

    let broker = MemoryBroker::with_credentials(
        settings.broker.user.clone(),
        settings.broker.password.clone(),
    );
    let connector = broker.connector_for(&settings.broker);
    let connection = Connection::establish(&connector, settings.requests.timeout())
        .await
        .context("connecting service tier to the bus")?;

    let registry = Registry::new(
        [(settings.user.name.clone(), settings.user.password.clone())],
        config.heartbeat_period,
    );
    let tier = LocalServiceTier::start(&connection, registry, Routing::AnyNode)
        .await
        .context("binding services")?;

    if config.demo_adapter {
        connection
            .service_registration()
            .bind_command_handler(
                Arc::new(AcceptAllAdapter),
                Routing::AnyNode,
                true,
                settings.requests.timeout(),
            )
            .await
            .context("binding demo adapter")?;
        info!("Demo adapter accepts every command");
    }

    // The manager owns its runtime and blocks on stop, so it lives off the
    // async worker threads.
    let manager_settings = settings.clone();
    let manager = tokio::task::spawn_blocking(move || {
        let manager =
            ApplicationConnectionManager::new(&manager_settings, Arc::new(connector))?;
        manager.add_connection_listener(Arc::new(LogListener));
        manager.start()?;
        Ok::<_, ClientError>(manager)
    })
    .await
    .context("starting application manager")??;

    println!();
    println!("Local gridlink service tier running!");
    println!("  Instance: {}", settings.application.instance_name);
    println!("  Login: {}", settings.user.name);
    println!(
        "  Services: {}, {}, {}, {}, {}",
        AuthToken::SERVICE,
        ApplicationConfig::SERVICE,
        StatusSnapshot::SERVICE,
        BatchServiceRequest::SERVICE,
        UserCommandRequest::SERVICE
    );
    println!();
    println!("Press Ctrl+C to stop");

    shutdown_signal().await;

    let manager = Arc::new(manager);
    let stopping = Arc::clone(&manager);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        error!(error = %e, "Application manager did not stop cleanly");
    }
    tier.stop();
    connection.disconnect().await;

    for record in tier.registry().applications() {
        info!(
            instance = %record.config.instance_name,
            online = record.online,
            "Application at shutdown"
        );
    }
    info!("Service tier shut down gracefully");
    println!("\nService tier stopped.");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
