// ABOUTME: Application login, registration and heartbeat protocol with miss tracking.
// ABOUTME: The manager drives it once per transport cycle to reach "fully connected".

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::application::{ApplicationConfig, HeartbeatConfig, StatusSnapshot};
use crate::connection::Connection;
use crate::envelope::Verb;
use crate::error::ClientError;
use crate::headers::{RequestHeaders, Routing};
use crate::session::Session;
use crate::settings::{NodeSettings, Settings, UserSettings};

/// What an application registers as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationRegistration {
    /// Instance name shown to operators.
    pub instance_name: String,
    /// Capabilities this application offers (e.g. "hmi", "fep").
    pub capabilities: Vec<String>,
    /// Machine the application runs on.
    pub node: NodeSettings,
}

impl ApplicationRegistration {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            capabilities: Vec::new(),
            node: NodeSettings::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            instance_name: settings.application.instance_name.clone(),
            capabilities: settings.application.capabilities.clone(),
            node: settings.node.clone(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_node(mut self, node: NodeSettings) -> Self {
        self.node = node;
        self
    }

    /// Registration request as sent to the application config service. The
    /// service fills in the user from the session's token.
    pub fn to_config(&self) -> ApplicationConfig {
        ApplicationConfig {
            instance_name: self.instance_name.clone(),
            user_name: String::new(),
            capabilities: self.capabilities.clone(),
            node_name: self.node.name.clone(),
            location: self.node.location.clone(),
            network: self.node.network.clone(),
            heartbeat: None,
        }
    }
}

/// Counts consecutive unacknowledged heartbeats.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            missed: 0,
        }
    }

    /// An acknowledgment resets the count.
    pub fn acknowledged(&mut self) {
        if self.missed > 0 {
            debug!(missed = self.missed, "Heartbeat acknowledged after misses");
        }
        self.missed = 0;
    }

    /// Record a miss. Errors once the tolerance is used up.
    pub fn missed(&mut self) -> Result<(), ClientError> {
        self.missed += 1;
        if self.missed >= self.max_missed {
            return Err(ClientError::HeartbeatTimeout {
                missed: self.missed,
            });
        }
        warn!(
            missed = self.missed,
            max_missed = self.max_missed,
            "Heartbeat not acknowledged"
        );
        Ok(())
    }

    pub fn missed_count(&self) -> u32 {
        self.missed
    }
}

/// Server-side half of connectivity: who we are and whether we are alive.
#[async_trait]
pub trait ApplicationProtocol: Send + Sync + 'static {
    /// Authenticate on a fresh connection.
    async fn login(&self, connection: &Connection, user: &UserSettings)
        -> Result<Session, ClientError>;

    /// Register the application and learn how to heartbeat.
    async fn register(
        &self,
        session: &Session,
        registration: &ApplicationRegistration,
    ) -> Result<HeartbeatConfig, ClientError>;

    /// Send one heartbeat and wait for its acknowledgment.
    async fn heartbeat(
        &self,
        session: &Session,
        config: &HeartbeatConfig,
        online: bool,
    ) -> Result<(), ClientError>;

    /// Revoke the session's token once the manager is done with it.
    async fn logout(&self, session: &Session) -> Result<(), ClientError> {
        session.logout().await
    }
}

/// Protocol spoken as session requests against the auth, application config
/// and status snapshot services.
#[derive(Debug, Default, Clone)]
pub struct BusApplicationProtocol;

#[async_trait]
impl ApplicationProtocol for BusApplicationProtocol {
    async fn login(
        &self,
        connection: &Connection,
        user: &UserSettings,
    ) -> Result<Session, ClientError> {
        connection.login(user).await
    }

    async fn register(
        &self,
        session: &Session,
        registration: &ApplicationRegistration,
    ) -> Result<HeartbeatConfig, ClientError> {
        let request = registration.to_config();
        let registered = session
            .put(&request)
            .one()
            .wait()
            .await
            .map_err(|e| match e {
                ClientError::BadRequest(reason)
                | ClientError::Unauthorized(reason)
                | ClientError::NotAllowed(reason) => ClientError::Registration(reason),
                other => other,
            })?;

        let heartbeat = registered.heartbeat.ok_or_else(|| {
            ClientError::ProtocolViolation("registration response carried no heartbeat config".into())
        })?;
        info!(
            instance = %heartbeat.instance_name,
            process_id = %heartbeat.process_id,
            period_ms = heartbeat.period_ms,
            "Application registered"
        );
        Ok(heartbeat)
    }

    async fn heartbeat(
        &self,
        session: &Session,
        config: &HeartbeatConfig,
        online: bool,
    ) -> Result<(), ClientError> {
        let headers = session.headers().merge(
            &RequestHeaders::new()
                .with_destination(Routing::address(&config.routing_key))
                .with_timeout(config.period()),
        );
        session
            .connection()
            .request::<StatusSnapshot, StatusSnapshot>(
                &config.destination,
                Verb::Put,
                &StatusSnapshot::for_config(config, online),
                headers,
            )
            .many()
            .wait()
            .await
            .map(|_| ())
    }
}
