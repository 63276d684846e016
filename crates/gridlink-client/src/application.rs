// ABOUTME: Wire types of the login, application registration and heartbeat services.
// ABOUTME: HeartbeatConfig is issued by the service tier and passed back unchanged on every heartbeat.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::session::ServiceType;

/// Login request and issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ServiceType for AuthToken {
    const SERVICE: &'static str = "auth_token";
}

impl AuthToken {
    pub fn request(login: &str, password: &str) -> Self {
        Self {
            login: login.to_string(),
            password: Some(password.to_string()),
            token: None,
        }
    }

    pub fn issued(login: &str, token: impl Into<String>) -> Self {
        Self {
            login: login.to_string(),
            password: None,
            token: Some(token.into()),
        }
    }

    pub fn revoke(token: &str) -> Self {
        Self {
            login: String::new(),
            password: None,
            token: Some(token.to_string()),
        }
    }
}

/// Where and how often an application must send heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub process_id: String,
    /// Exchange heartbeats are published to.
    pub destination: String,
    pub period_ms: u64,
    pub routing_key: String,
    pub instance_name: String,
}

impl HeartbeatConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

/// Registration of a running application instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub instance_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Filled in by the service tier on successful registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatConfig>,
}

impl ServiceType for ApplicationConfig {
    const SERVICE: &'static str = "application_config";
}

/// One heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub process_id: String,
    pub instance_name: String,
    pub online: bool,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

impl ServiceType for StatusSnapshot {
    const SERVICE: &'static str = "status_snapshot";
}

impl StatusSnapshot {
    pub fn for_config(config: &HeartbeatConfig, online: bool) -> Self {
        Self {
            process_id: config.process_id.clone(),
            instance_name: config.instance_name.clone(),
            online,
            time: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> HeartbeatConfig {
        HeartbeatConfig {
            process_id: "p-1".into(),
            destination: "status_snapshot".into(),
            period_ms: 250,
            routing_key: "heartbeat".into(),
            instance_name: "hmi-1".into(),
        }
    }

    #[test]
    fn test_login_request_never_carries_token() {
        let json = serde_json::to_value(AuthToken::request("operator", "pw")).unwrap();
        assert_eq!(json["login"], "operator");
        assert!(json.get("token").is_none());

        let issued = AuthToken::issued("operator", "t-9");
        assert!(issued.password.is_none());
        assert_eq!(issued.token.as_deref(), Some("t-9"));
    }

    #[test]
    fn test_snapshot_copies_heartbeat_identity() {
        let snapshot = StatusSnapshot::for_config(&heartbeat(), true);
        assert_eq!(snapshot.process_id, "p-1");
        assert_eq!(snapshot.instance_name, "hmi-1");
        assert!(snapshot.online);
        assert!(snapshot.time > 0);
    }

    #[test]
    fn test_heartbeat_period() {
        assert_eq!(heartbeat().period(), Duration::from_millis(250));
        let zero = HeartbeatConfig {
            period_ms: 0,
            ..heartbeat()
        };
        assert_eq!(zero.period(), Duration::from_millis(1));
    }

    #[test]
    fn test_application_config_minimal_json() {
        let config: ApplicationConfig =
            serde_json::from_str(r#"{"instance_name":"adapter-3"}"#).unwrap();
        assert_eq!(config.instance_name, "adapter-3");
        assert!(config.heartbeat.is_none());
        assert!(config.capabilities.is_empty());
    }
}
