// ABOUTME: Configuration for broker access, identity, reconnect and heartbeat policy.
// ABOUTME: Loaded from TOML with defaults for every section; broker scheme selects TLS.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default AMQP port without TLS.
pub const DEFAULT_PORT: u16 = 5672;
/// Default AMQP port with TLS.
pub const DEFAULT_TLS_PORT: u16 = 5671;

/// Broker address and login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker URL, e.g. "amqp://broker.local:5672". "amqps://" enables TLS.
    pub address: String,
    pub user: String,
    pub password: String,
    pub virtual_host: String,
    /// Transport-level heartbeat negotiated with the broker.
    pub heartbeat_secs: u64,
    pub use_tls: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::new("amqp://127.0.0.1:5672")
    }
}

impl BrokerSettings {
    /// Settings for `address` with guest credentials. TLS follows the scheme.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into().trim().to_string();
        let use_tls = address.to_lowercase().starts_with("amqps://");
        Self {
            address,
            user: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            heartbeat_secs: 30,
            use_tls,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    /// Enable TLS, rewriting an "amqp://" address to "amqps://".
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self.address = Self::rewrite_scheme(&self.address, true);
        self
    }

    /// Disable TLS, rewriting an "amqps://" address to "amqp://".
    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self.address = Self::rewrite_scheme(&self.address, false);
        self
    }

    fn rewrite_scheme(address: &str, tls: bool) -> String {
        let lower = address.to_lowercase();
        if tls && lower.starts_with("amqp://") {
            format!("amqps://{}", &address["amqp://".len()..])
        } else if !tls && lower.starts_with("amqps://") {
            format!("amqp://{}", &address["amqps://".len()..])
        } else {
            address.to_string()
        }
    }

    /// Host part of the address.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.address)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// Port from the address, or the scheme default.
    pub fn port(&self) -> u16 {
        url::Url::parse(&self.address)
            .ok()
            .and_then(|u| u.port())
            .unwrap_or(if self.use_tls {
                DEFAULT_TLS_PORT
            } else {
                DEFAULT_PORT
            })
    }
}

impl fmt::Display for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "amqps" } else { "amqp" };
        write!(
            f,
            "{}://{}@{}:{}{}",
            scheme,
            self.user,
            self.host().unwrap_or_else(|| "?".to_string()),
            self.port(),
            self.virtual_host
        )
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Login presented to the service tier.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub name: String,
    pub password: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            name: "system".to_string(),
            password: String::new(),
        }
    }
}

impl UserSettings {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for UserSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSettings")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity of the machine an application runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Defaults to the hostname.
    pub name: String,
    pub location: Option<String>,
    pub network: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            location: None,
            network: None,
        }
    }
}

/// What the application registers as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub instance_name: String,
    pub capabilities: Vec<String>,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            instance_name: "gridlink-app".to_string(),
            capabilities: Vec::new(),
        }
    }
}

/// Exponential backoff between transport connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub start_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            start_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(start_delay: Duration, max_delay: Duration) -> Self {
        Self {
            start_delay_ms: start_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms.max(1))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms).max(self.start_delay())
    }

    /// Delay after another failure: double the current one, capped.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).clamp(self.start_delay(), self.max_delay())
    }
}

/// How the application-level heartbeat is supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPolicy {
    /// Consecutive unacknowledged heartbeats before leaving "fully connected".
    pub max_missed: u32,
    /// Pause before registering again while the transport stays up.
    pub retry_delay_ms: u64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            max_missed: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl HeartbeatPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Request defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub timeout_ms: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl RequestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Everything an application connection manager needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub user: UserSettings,
    pub node: NodeSettings,
    pub application: ApplicationSettings,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatPolicy,
    pub requests: RequestSettings,
}

impl Settings {
    /// `$XDG_CONFIG_HOME/gridlink`, falling back to `~/.config/gridlink`.
    pub fn config_dir() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("gridlink")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default path, or defaults if no file exists.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(content)?;
        // An explicit amqps:// address always means TLS.
        if settings.broker.address.to_lowercase().starts_with("amqps://") {
            settings.broker.use_tls = true;
        }
        Ok(settings)
    }

    /// Write the default template to `path` unless a file is already there.
    pub fn init(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, Self::default_toml())
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(true)
    }

    /// Commented template with every default spelled out.
    pub fn default_toml() -> String {
        r#"# gridlink settings

[broker]
# amqps:// enables TLS
address = "amqp://127.0.0.1:5672"
user = "guest"
password = "guest"
virtual_host = "/"
heartbeat_secs = 30

[user]
# Login presented to the service tier
name = "system"
password = ""

[node]
# name defaults to the hostname
# location = "substation-north"
# network = "field-lan"

[application]
instance_name = "gridlink-app"
capabilities = []

[reconnect]
start_delay_ms = 250
max_delay_ms = 30000

[heartbeat]
max_missed = 3
retry_delay_ms = 1000

[requests]
timeout_ms = 5000
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_broker_settings_detects_tls_from_scheme() {
        assert!(!BrokerSettings::new("amqp://broker:5672").use_tls);
        assert!(BrokerSettings::new("AMQPS://broker:5671").use_tls);
    }

    #[test]
    fn test_broker_settings_tls_rewrites_scheme() {
        let settings = BrokerSettings::new("amqp://broker:5672").with_tls();
        assert_eq!(settings.address, "amqps://broker:5672");
        let settings = settings.without_tls();
        assert_eq!(settings.address, "amqp://broker:5672");
        assert!(!settings.use_tls);
    }

    #[test]
    fn test_broker_settings_display_hides_password() {
        let settings = BrokerSettings::new("amqp://broker.local")
            .with_credentials("scada", "hunter2")
            .with_virtual_host("/grid");
        assert_eq!(settings.to_string(), "amqp://scada@broker.local:5672/grid");
        assert!(!format!("{settings:?}").contains("hunter2"));
    }

    #[test]
    fn test_broker_port_defaults_follow_tls() {
        assert_eq!(BrokerSettings::new("amqps://broker").port(), DEFAULT_TLS_PORT);
        assert_eq!(BrokerSettings::new("amqp://broker:5800").port(), 5800);
    }

    #[test]
    fn test_reconnect_backoff_doubles_and_clamps() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        let mut delay = policy.start_delay();
        let mut seen = vec![delay];
        for _ in 0..4 {
            delay = policy.next_delay(delay);
            seen.push(delay);
        }
        let millis: Vec<u128> = seen.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_reconnect_max_never_below_start() {
        let policy = ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.heartbeat.max_missed, 3);
        assert_eq!(settings.requests.timeout(), Duration::from_secs(5));
        assert_eq!(settings.reconnect.start_delay(), Duration::from_millis(250));
        assert!(!settings.node.name.is_empty());
    }

    #[test]
    fn test_default_toml_parses_to_defaults() {
        let parsed = Settings::from_toml(&Settings::default_toml()).unwrap();
        let defaults = Settings::default();
        assert_eq!(parsed.broker, defaults.broker);
        assert_eq!(parsed.reconnect, defaults.reconnect);
        assert_eq!(parsed.heartbeat, defaults.heartbeat);
        assert_eq!(parsed.requests, defaults.requests);
        assert_eq!(parsed.application, defaults.application);
    }

    #[test]
    fn test_load_from_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\naddress = \"amqps://grid.example:5671\"\n\n[heartbeat]\nmax_missed = 5"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.broker.use_tls);
        assert_eq!(settings.broker.user, "guest");
        assert_eq!(settings.heartbeat.max_missed, 5);
        assert_eq!(settings.heartbeat.retry_delay_ms, 1_000);
    }

    #[test]
    fn test_load_from_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker\naddress = ").unwrap();
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse settings"));
    }

    #[test]
    fn test_init_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        assert!(Settings::init(&path).unwrap());
        assert!(!Settings::init(&path).unwrap());
        assert!(Settings::load_from(&path).is_ok());
    }
}
