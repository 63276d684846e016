// ABOUTME: Client core for gridlink applications - connectivity, RPC sessions, subscriptions, commands
// ABOUTME: Shared by HMI clients, front-end processors and services on the local service tier

pub mod application;
pub mod batching;
pub mod command;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod headers;
pub mod manager;
pub mod memory;
pub mod observer;
pub mod promise;
pub mod registration;
pub mod service;
pub mod session;
pub mod settings;
pub mod subscription;
pub mod transport;

pub use application::{ApplicationConfig, AuthToken, HeartbeatConfig, StatusSnapshot};
pub use batching::{BatchEntry, BatchServiceRequest, Batching};
pub use command::{
    CommandDispatcher, CommandExecution, CommandRequest, CommandRequestHandler, CommandResponse,
    CommandService, CommandStatus, CommandTracker, CommandType, CommandValue, TrackedCommand,
    UserCommandRequest,
};
pub use connection::Connection;
pub use envelope::{EventType, ServiceRequest, ServiceResponse, Status, Verb};
pub use error::ClientError;
pub use factory::{ConnectionWatcher, ReconnectingFactory};
pub use headers::{RequestHeaders, Routing};
pub use manager::{ApplicationConnectionListener, ApplicationConnectionManager, ConnectionState};
pub use memory::MemoryBroker;
pub use observer::{RequestListener, SubscriptionCreationListener};
pub use promise::{Completer, Promise, PromiseResult};
pub use registration::{
    ApplicationProtocol, ApplicationRegistration, BusApplicationProtocol, HeartbeatMonitor,
};
pub use service::{EventPublisher, ResponseCallback, Service, ServiceBinding, ServiceRegistration};
pub use session::{Response, ServiceType, Session, SubscriptionResult};
pub use settings::Settings;
pub use subscription::{
    Subscription, SubscriptionBinding, SubscriptionEvent, SubscriptionEventAcceptor,
};
pub use transport::{BrokerConnection, Connector};
