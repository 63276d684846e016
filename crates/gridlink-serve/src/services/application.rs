// ABOUTME: Application config and status snapshot services
// ABOUTME: Registration hands out heartbeat configs; heartbeats keep the registry's online flags fresh

use std::sync::Arc;

use gridlink_client::{
    ApplicationConfig, ClientError, ResponseCallback, Service, ServiceRequest, Status,
    StatusSnapshot, Verb,
};

use super::authenticate;
use crate::registry::Registry;

pub struct ApplicationService {
    registry: Arc<Registry>,
}

impl ApplicationService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Service for ApplicationService {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        let user = match authenticate(&self.registry, &request) {
            Ok(user) => user,
            Err(e) => return callback.fail(&e),
        };

        match request.verb {
            Verb::Put | Verb::Post => {
                let config: ApplicationConfig = match request.payload_as() {
                    Ok(config) => config,
                    Err(e) => return callback.fail(&e),
                };
                if config.instance_name.is_empty() {
                    return callback.fail(&ClientError::BadRequest(
                        "instance_name is required".to_string(),
                    ));
                }
                let registered = self.registry.register(&user, config);
                callback.succeed(Status::Ok, &[registered]);
            }
            Verb::Get => {
                let configs: Vec<ApplicationConfig> = self
                    .registry
                    .applications()
                    .into_iter()
                    .map(|record| record.config)
                    .collect();
                callback.succeed(Status::Ok, &configs);
            }
            verb => callback.fail(&ClientError::NotAllowed(format!(
                "{verb} is not supported for application_config"
            ))),
        }
    }
}

pub struct StatusService {
    registry: Arc<Registry>,
}

impl StatusService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Service for StatusService {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        if request.verb != Verb::Put {
            return callback.fail(&ClientError::NotAllowed(format!(
                "{} is not supported for status_snapshot",
                request.verb
            )));
        }
        let snapshot: StatusSnapshot = match request.payload_as() {
            Ok(snapshot) => snapshot,
            Err(e) => return callback.fail(&e),
        };
        // Heartbeats keep the sender's token from expiring.
        if let Some(token) = request.headers.auth_token() {
            self.registry.touch(token);
        }
        if self.registry.heartbeat(&snapshot) {
            callback.succeed(Status::Updated, &[snapshot]);
        } else {
            callback.fail(&ClientError::BadRequest(format!(
                "unknown process {}",
                snapshot.process_id
            )));
        }
    }
}
