// ABOUTME: Batch service: runs each entry of a batch against its own service exchange, in order
// ABOUTME: Entries are forwarded over the bus with their original headers, so every service authenticates as usual

use gridlink_client::{
    BatchServiceRequest, ClientError, Connection, ResponseCallback, Service, ServiceRequest,
    ServiceResponse, ServiceType, Status, Verb,
};
use tracing::{debug, warn};

pub struct BatchService {
    connection: Connection,
}

impl BatchService {
    /// Entries are forwarded over `connection`.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

impl Service for BatchService {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        if request.verb != Verb::Post {
            return callback.fail(&ClientError::NotAllowed(format!(
                "{} is not supported for batch_service_request",
                request.verb
            )));
        }
        let mut batch: BatchServiceRequest = match request.payload_as() {
            Ok(batch) => batch,
            Err(e) => return callback.fail(&e),
        };
        if batch
            .requests
            .iter()
            .any(|entry| entry.exchange == BatchServiceRequest::SERVICE)
        {
            return callback.fail(&ClientError::BadRequest(
                "batches cannot be nested".to_string(),
            ));
        }

        let connection = self.connection.clone();
        tokio::spawn(async move {
            debug!(requests = batch.requests.len(), "Running batch");
            for entry in &mut batch.requests {
                let id = entry.request.id.clone();
                let response = match connection
                    .send(&entry.exchange, entry.request.clone())
                    .wait()
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(request_id = %id, exchange = %entry.exchange, error = %e, "Batch entry failed");
                        ServiceResponse::from_error(id, &e)
                    }
                };
                entry.response = Some(response);
            }
            callback.succeed(Status::Ok, &[batch]);
        });
    }
}
