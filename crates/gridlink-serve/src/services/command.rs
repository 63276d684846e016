// ABOUTME: User command relay: forwards client commands to adapters and reports the final status
// ABOUTME: Stamps each command with a uid and the issuing user before dispatch

use std::sync::Arc;

use gridlink_client::{
    ClientError, CommandDispatcher, ResponseCallback, Routing, Service, ServiceRequest, Status,
    UserCommandRequest, Verb,
};
use tracing::info;
use uuid::Uuid;

use super::authenticate;
use crate::registry::Registry;

pub struct CommandRelay {
    registry: Arc<Registry>,
    dispatcher: CommandDispatcher,
    adapters: Routing,
}

impl CommandRelay {
    /// Relay to adapters bound under `adapters`.
    pub fn new(registry: Arc<Registry>, dispatcher: CommandDispatcher, adapters: Routing) -> Self {
        Self {
            registry,
            dispatcher,
            adapters,
        }
    }
}

impl Service for CommandRelay {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        if request.verb != Verb::Post {
            return callback.fail(&ClientError::NotAllowed(format!(
                "{} is not supported for user_command_request",
                request.verb
            )));
        }
        let user = match authenticate(&self.registry, &request) {
            Ok(user) => user,
            Err(e) => return callback.fail(&e),
        };
        let mut command: UserCommandRequest = match request.payload_as() {
            Ok(command) => command,
            Err(e) => return callback.fail(&e),
        };

        command.uid = Uuid::new_v4().to_string();
        command.user = Some(user.clone());
        command.status = None;
        info!(
            uid = %command.uid,
            user = %user,
            command = %command.command_request.name,
            "Relaying user command"
        );

        let result = match self.dispatcher.dispatch_request(
            command.command_request.clone(),
            Some(user),
            &self.adapters,
            command.timeout(),
        ) {
            Ok(result) => result,
            Err(e) => return callback.fail(&e),
        };
        result.listen(move |result| match result {
            Ok(status) => {
                command.status = Some(status);
                callback.succeed(Status::Ok, &[command]);
            }
            Err(e) => callback.fail(&e),
        });
    }
}
