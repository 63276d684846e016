// ABOUTME: Local gridlink service tier - auth, application registry, heartbeats, command relay
// ABOUTME: Runs the services on an in-process bus for development and single-host installs

pub mod registry;
pub mod server;
pub mod services;

use std::time::Duration;

use anyhow::Result;
use gridlink_client::Settings;

pub use registry::{ApplicationRecord, Registry};
pub use server::{AcceptAllAdapter, LocalServiceTier};

/// Configuration for the local service tier
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Broker, login and application settings (default: ~/.config/gridlink/config.toml)
    pub settings: Settings,
    /// Heartbeat period handed to registering applications (default: 1s)
    pub heartbeat_period: Duration,
    /// Bind an adapter that accepts every command
    pub demo_adapter: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            heartbeat_period: Duration::from_secs(1),
            demo_adapter: false,
        }
    }
}

/// Run the local service tier
pub async fn run(config: ServeConfig) -> Result<()> {
    server::run(config).await
}
