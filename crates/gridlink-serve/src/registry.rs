// ABOUTME: In-memory registry of users, issued tokens and registered applications
// ABOUTME: Shared by the auth, application config and status snapshot services

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gridlink_client::{ApplicationConfig, HeartbeatConfig, StatusSnapshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Exchange applications heartbeat to.
pub const HEARTBEAT_DESTINATION: &str = "status_snapshot";
/// Routing key heartbeats are published under.
pub const HEARTBEAT_ROUTING_KEY: &str = "heartbeat";

/// Tokens unused for this long are dropped at the next login.
pub const DEFAULT_TOKEN_IDLE: Duration = Duration::from_secs(30 * 60);

struct IssuedToken {
    user: String,
    last_used: Instant,
}

/// One registered application instance.
#[derive(Debug, Clone)]
pub struct ApplicationRecord {
    pub config: ApplicationConfig,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ApplicationRecord {
    pub fn process_id(&self) -> &str {
        self.config
            .heartbeat
            .as_ref()
            .map(|h| h.process_id.as_str())
            .unwrap_or_default()
    }
}

pub struct Registry {
    users: HashMap<String, String>,
    tokens: RwLock<HashMap<String, IssuedToken>>,
    applications: RwLock<HashMap<String, ApplicationRecord>>,
    heartbeat_period: Duration,
    token_idle: Duration,
}

impl Registry {
    /// `users` maps login to password.
    pub fn new(
        users: impl IntoIterator<Item = (String, String)>,
        heartbeat_period: Duration,
    ) -> Arc<Self> {
        Self::with_token_idle(users, heartbeat_period, DEFAULT_TOKEN_IDLE)
    }

    /// Like [`Registry::new`], expiring tokens left unused for `token_idle`.
    pub fn with_token_idle(
        users: impl IntoIterator<Item = (String, String)>,
        heartbeat_period: Duration,
        token_idle: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            users: users.into_iter().collect(),
            tokens: RwLock::new(HashMap::new()),
            applications: RwLock::new(HashMap::new()),
            heartbeat_period,
            token_idle,
        })
    }

    /// Issue a token if the credentials match. Idle tokens are swept first;
    /// clients that lose their transport never get to log out.
    pub fn login(&self, login: &str, password: &str) -> Option<String> {
        if self.users.get(login).map(String::as_str) != Some(password) {
            return None;
        }
        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.len();
        tokens.retain(|_, issued| now.duration_since(issued.last_used) < self.token_idle);
        if tokens.len() < before {
            debug!(expired = before - tokens.len(), "Expired idle auth tokens");
        }
        tokens.insert(
            token.clone(),
            IssuedToken {
                user: login.to_string(),
                last_used: now,
            },
        );
        info!(user = %login, "Issued auth token");
        Some(token)
    }

    pub fn logout(&self, token: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    /// User a token was issued to. Counts as a use of the token.
    pub fn user_for(&self, token: &str) -> Option<String> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let issued = tokens.get_mut(token)?;
        if issued.last_used.elapsed() >= self.token_idle {
            tokens.remove(token);
            return None;
        }
        issued.last_used = Instant::now();
        Some(issued.user.clone())
    }

    /// Keep a token alive without resolving its user.
    pub fn touch(&self, token: &str) {
        let _ = self.user_for(token);
    }

    pub fn token_count(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record a registration and hand out its heartbeat config.
    pub fn register(&self, user: &str, request: ApplicationConfig) -> ApplicationConfig {
        let process_id = Uuid::new_v4().to_string();
        let mut config = request;
        config.user_name = user.to_string();
        config.heartbeat = Some(HeartbeatConfig {
            process_id: process_id.clone(),
            destination: HEARTBEAT_DESTINATION.to_string(),
            period_ms: self.heartbeat_period.as_millis() as u64,
            routing_key: HEARTBEAT_ROUTING_KEY.to_string(),
            instance_name: config.instance_name.clone(),
        });
        info!(
            instance = %config.instance_name,
            user = %config.user_name,
            process_id = %process_id,
            "Application registered"
        );
        self.applications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                process_id,
                ApplicationRecord {
                    config: config.clone(),
                    online: false,
                    last_seen: None,
                },
            );
        config
    }

    /// Apply a heartbeat. False for unknown processes.
    pub fn heartbeat(&self, snapshot: &StatusSnapshot) -> bool {
        let mut applications = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(record) = applications.get_mut(&snapshot.process_id) else {
            return false;
        };
        if record.online != snapshot.online {
            info!(
                instance = %snapshot.instance_name,
                online = snapshot.online,
                "Application status changed"
            );
        }
        record.online = snapshot.online;
        record.last_seen = Some(Utc::now());
        debug!(process_id = %snapshot.process_id, "Heartbeat");
        true
    }

    pub fn application(&self, process_id: &str) -> Option<ApplicationRecord> {
        self.applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(process_id)
            .cloned()
    }

    pub fn applications(&self) -> Vec<ApplicationRecord> {
        self.applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<Registry> {
        Registry::new(
            [("operator".to_string(), "pw".to_string())],
            Duration::from_millis(500),
        )
    }

    fn request(instance: &str) -> ApplicationConfig {
        ApplicationConfig {
            instance_name: instance.into(),
            user_name: String::new(),
            capabilities: vec![],
            node_name: "node-1".into(),
            location: None,
            network: None,
            heartbeat: None,
        }
    }

    #[test]
    fn test_login_checks_password() {
        let registry = registry();
        assert!(registry.login("operator", "wrong").is_none());
        assert!(registry.login("nobody", "pw").is_none());
        let token = registry.login("operator", "pw").unwrap();
        assert_eq!(registry.user_for(&token).as_deref(), Some("operator"));
        assert!(registry.logout(&token));
        assert!(registry.user_for(&token).is_none());
        assert!(!registry.logout(&token));
    }

    #[test]
    fn test_idle_tokens_expire_at_next_login() {
        let registry = Registry::with_token_idle(
            [("operator".to_string(), "pw".to_string())],
            Duration::from_millis(500),
            Duration::from_millis(200),
        );
        let abandoned = registry.login("operator", "pw").unwrap();
        let active = registry.login("operator", "pw").unwrap();
        assert_eq!(registry.token_count(), 2);

        std::thread::sleep(Duration::from_millis(120));
        registry.touch(&active);
        std::thread::sleep(Duration::from_millis(120));

        let fresh = registry.login("operator", "pw").unwrap();
        assert_eq!(registry.token_count(), 2);
        assert!(registry.user_for(&abandoned).is_none());
        assert_eq!(registry.user_for(&active).as_deref(), Some("operator"));
        assert_eq!(registry.user_for(&fresh).as_deref(), Some("operator"));
    }

    #[test]
    fn test_register_assigns_heartbeat() {
        let registry = registry();
        let config = registry.register("operator", request("hmi-1"));
        assert_eq!(config.user_name, "operator");
        let heartbeat = config.heartbeat.unwrap();
        assert_eq!(heartbeat.period_ms, 500);
        assert_eq!(heartbeat.destination, HEARTBEAT_DESTINATION);
        assert_eq!(heartbeat.instance_name, "hmi-1");

        let record = registry.application(&heartbeat.process_id).unwrap();
        assert!(!record.online);
        assert!(record.last_seen.is_none());
    }

    #[test]
    fn test_heartbeat_updates_record() {
        let registry = registry();
        let config = registry.register("operator", request("fep-1"));
        let heartbeat = config.heartbeat.unwrap();

        assert!(registry.heartbeat(&StatusSnapshot::for_config(&heartbeat, true)));
        let record = registry.application(&heartbeat.process_id).unwrap();
        assert!(record.online);
        assert!(record.last_seen.is_some());
        assert_eq!(record.process_id(), heartbeat.process_id);

        let stranger = StatusSnapshot {
            process_id: "unknown".into(),
            instance_name: "x".into(),
            online: true,
            time: 0,
        };
        assert!(!registry.heartbeat(&stranger));
    }
}
