// ABOUTME: Request batching: a session in batch mode queues its requests and flushes them as one envelope.
// ABOUTME: Each queued promise resolves from its own entry in the batch reply, before the flush promise does.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::{ServiceRequest, ServiceResponse, Verb};
use crate::error::ClientError;
use crate::promise::{Completer, Promise};
use crate::session::{ServiceType, Session};

/// One request inside a batch, with the exchange it was meant for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub exchange: String,
    pub request: ServiceRequest,
    /// Filled in by the batch service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ServiceResponse>,
}

/// Requests executed in order by the batch service. The reply echoes the
/// entries with their responses attached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchServiceRequest {
    pub requests: Vec<BatchEntry>,
}

impl ServiceType for BatchServiceRequest {
    const SERVICE: &'static str = "batch_service_request";
}

struct QueuedRequest {
    exchange: String,
    request: ServiceRequest,
    completer: Completer<ServiceResponse>,
}

/// Where [`BatchQueue::route`] put a request.
pub(crate) enum Routed {
    Queued(Promise<ServiceResponse>),
    Direct(ServiceRequest),
}

/// Per-session queue; `None` outside batch mode.
#[derive(Default)]
pub(crate) struct BatchQueue {
    queue: Mutex<Option<Vec<QueuedRequest>>>,
}

impl BatchQueue {
    fn lock(&self) -> MutexGuard<'_, Option<Vec<QueuedRequest>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `request` in batch mode; otherwise hand it back to be sent.
    pub(crate) fn route(&self, exchange: &str, request: ServiceRequest) -> Routed {
        let mut queue = self.lock();
        match queue.as_mut() {
            Some(queued) => {
                let (promise, completer) = Promise::pending();
                queued.push(QueuedRequest {
                    exchange: exchange.to_string(),
                    request,
                    completer,
                });
                Routed::Queued(promise)
            }
            None => Routed::Direct(request),
        }
    }

    fn start(&self) -> Result<(), ClientError> {
        let mut queue = self.lock();
        if queue.is_some() {
            return Err(ClientError::IllegalState(
                "session is already batching".to_string(),
            ));
        }
        *queue = Some(Vec::new());
        Ok(())
    }

    /// Everything queued so far; batch mode stays on.
    fn take(&self) -> Result<Vec<QueuedRequest>, ClientError> {
        match self.lock().as_mut() {
            Some(queued) => Ok(std::mem::take(queued)),
            None => Err(ClientError::IllegalState(
                "session is not batching".to_string(),
            )),
        }
    }

    fn exit(&self) -> Vec<QueuedRequest> {
        self.lock().take().unwrap_or_default()
    }

    fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, Vec::len)
    }
}

/// Batch mode switch for one session (and its clones).
///
/// Between `start` and `exit` every request the session makes is queued and
/// its promise stays pending until a flush. Do not block on such a promise
/// before flushing; it cannot complete.
#[derive(Debug, Clone)]
pub struct Batching {
    session: Session,
}

impl Batching {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    /// Begin queueing requests. Fails if already batching.
    pub fn start(&self) -> Result<(), ClientError> {
        self.session.batch_queue().start()?;
        debug!("Batch mode started");
        Ok(())
    }

    /// Leave batch mode. Requests not yet flushed fail with `IllegalState`.
    pub fn exit(&self) {
        let discarded = self.session.batch_queue().exit();
        if !discarded.is_empty() {
            warn!(discarded = discarded.len(), "Discarding unflushed batch");
        }
        for queued in discarded {
            queued.completer.fail(ClientError::IllegalState(format!(
                "batch exited before request {} was flushed",
                queued.request.id
            )));
        }
    }

    pub fn is_batching(&self) -> bool {
        self.session.batch_queue().is_active()
    }

    /// Requests waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.session.batch_queue().len()
    }

    /// Send every queued request as one batch. An empty queue resolves
    /// straight away without touching the bus.
    pub fn flush(&self) -> Promise<BatchServiceRequest> {
        let queued = match self.session.batch_queue().take() {
            Ok(queued) => queued,
            Err(e) => return Promise::err(e),
        };
        if queued.is_empty() {
            return Promise::ok(BatchServiceRequest::default());
        }
        send_batch(&self.session, queued)
    }

    /// Send the queue as consecutive batches of at most `chunk_size`
    /// requests, each after the previous one answered. Resolves `true` if
    /// every batch succeeded; failed batches fail their own requests.
    pub fn flush_chunked(&self, chunk_size: usize) -> Promise<bool> {
        if chunk_size == 0 {
            return Promise::err(ClientError::IllegalState(
                "batch chunk size must be at least 1".to_string(),
            ));
        }
        let queued = match self.session.batch_queue().take() {
            Ok(queued) => queued,
            Err(e) => return Promise::err(e),
        };
        if queued.is_empty() {
            return Promise::ok(true);
        }

        let mut chunks = Vec::new();
        let mut rest = queued.into_iter();
        loop {
            let chunk: Vec<QueuedRequest> = rest.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }

        let (promise, completer) = Promise::pending();
        let session = self.session.clone();
        self.session.connection().handle().spawn(async move {
            let total = chunks.len();
            let mut all_ok = true;
            for (index, chunk) in chunks.into_iter().enumerate() {
                if let Err(e) = send_batch(&session, chunk).wait().await {
                    warn!(chunk = index + 1, total, error = %e, "Batch chunk failed");
                    all_ok = false;
                }
            }
            completer.succeed(all_ok);
        });
        promise
    }
}

fn send_batch(session: &Session, queued: Vec<QueuedRequest>) -> Promise<BatchServiceRequest> {
    let mut requests = Vec::with_capacity(queued.len());
    let mut waiting = Vec::with_capacity(queued.len());
    for entry in queued {
        waiting.push((entry.request.id.clone(), entry.completer));
        requests.push(BatchEntry {
            exchange: entry.exchange,
            request: entry.request,
            response: None,
        });
    }
    let batch = BatchServiceRequest { requests };
    debug!(requests = batch.requests.len(), "Flushing request batch");

    let reply = session
        .connection()
        .request::<BatchServiceRequest, BatchServiceRequest>(
            BatchServiceRequest::SERVICE,
            Verb::Post,
            &batch,
            session.headers(),
        )
        .one();

    let (promise, completer) = Promise::pending();
    reply.listen(move |result| {
        match &result {
            Ok(answered) => distribute(answered, waiting),
            Err(e) => {
                for (_, queued) in waiting {
                    queued.fail(e.clone());
                }
            }
        }
        completer.complete(result);
    });
    promise
}

/// Resolve each queued request from its entry in the reply, matched by id.
fn distribute(answered: &BatchServiceRequest, waiting: Vec<(String, Completer<ServiceResponse>)>) {
    let mut responses: HashMap<&str, &ServiceResponse> = answered
        .requests
        .iter()
        .filter_map(|entry| {
            entry
                .response
                .as_ref()
                .map(|response| (entry.request.id.as_str(), response))
        })
        .collect();
    for (id, queued) in waiting {
        match responses.remove(id.as_str()) {
            Some(response) => {
                queued.succeed(response.clone());
            }
            None => {
                queued.fail(ClientError::ProtocolViolation(format!(
                    "batch reply has no response for request {id}"
                )));
            }
        }
    }
}
