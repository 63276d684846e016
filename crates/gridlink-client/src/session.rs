// ABOUTME: Typed RPC session: get/delete/post/put against service exchanges, each returning a Promise.
// ABOUTME: Also owns default request headers, batch mode, request observers and subscription binding.

use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::batching::{BatchQueue, Batching, Routed};
use crate::connection::Connection;
use crate::envelope::{ServiceRequest, ServiceResponse, Status, Verb};
use crate::error::ClientError;
use crate::headers::RequestHeaders;
use crate::observer::{ListenerSet, RequestListener, SubscriptionCreationListener};
use crate::promise::Promise;
use crate::subscription::Subscription;

/// A payload type served by a bus service.
///
/// The service name doubles as the exchange requests are published to;
/// events for the type go to [`ServiceType::event_exchange`].
pub trait ServiceType: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const SERVICE: &'static str;

    fn event_exchange() -> String {
        format!("{}.events", Self::SERVICE)
    }
}

/// Typed view of a service response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    status: Status,
    error_message: String,
    results: Vec<T>,
}

impl<T> Response<T> {
    pub fn new(status: Status, results: Vec<T>) -> Self {
        Self {
            status,
            error_message: String::new(),
            results,
        }
    }

    pub fn failed(status: Status, error_message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: error_message.into(),
            results: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn list(&self) -> &[T] {
        &self.results
    }

    /// The result list, or the failure status as an error.
    pub fn many(self) -> Result<Vec<T>, ClientError> {
        if self.is_success() {
            Ok(self.results)
        } else {
            Err(ClientError::from_status(self.status, self.error_message))
        }
    }

    /// Exactly one result.
    pub fn one(self) -> Result<T, ClientError> {
        let mut results = self.many()?;
        if results.len() != 1 {
            return Err(ClientError::Expectation(format!(
                "expected one result, got {}",
                results.len()
            )));
        }
        Ok(results.remove(0))
    }

    /// Zero or one result.
    pub fn one_or_none(self) -> Result<Option<T>, ClientError> {
        let mut results = self.many()?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(Some(results.remove(0))),
            n => Err(ClientError::Expectation(format!(
                "expected at most one result, got {n}"
            ))),
        }
    }
}

impl<T: DeserializeOwned> Response<T> {
    /// Decode the payload of a wire response. Failure statuses are kept as
    /// data; only undecodable payloads are errors.
    pub(crate) fn decode(response: ServiceResponse) -> Result<Self, ClientError> {
        if !response.status.is_success() {
            return Ok(Self::failed(response.status, response.error_message));
        }
        let results = response
            .payload
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(Self {
            status: response.status,
            error_message: response.error_message,
            results,
        })
    }
}

impl<T: Clone + Send + 'static> Promise<Response<T>> {
    pub fn one(&self) -> Promise<T> {
        self.transform(Response::one)
    }

    pub fn one_or_none(&self) -> Promise<Option<T>> {
        self.transform(Response::one_or_none)
    }

    pub fn many(&self) -> Promise<Vec<T>> {
        self.transform(Response::many)
    }
}

/// Integrity poll result paired with the subscription that follows it.
#[derive(Debug, Clone)]
pub struct SubscriptionResult<T> {
    pub result: Vec<T>,
    pub subscription: Subscription<T>,
}

/// State shared by a session and its clones.
#[derive(Default)]
struct SessionShared {
    headers: RwLock<RequestHeaders>,
    batch: BatchQueue,
    request_listeners: ListenerSet<dyn RequestListener>,
    creation_listeners: ListenerSet<dyn SubscriptionCreationListener>,
}

/// Request issuer bound to one connection with a set of default headers.
///
/// Sessions die with their connection; after a reconnect obtain a new one.
/// Clones share headers, batch mode and listeners.
#[derive(Clone)]
pub struct Session {
    connection: Connection,
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .field("authenticated", &self.headers().auth_token().is_some())
            .finish()
    }
}

impl Session {
    pub fn new(connection: Connection, headers: RequestHeaders) -> Self {
        Self {
            connection,
            shared: Arc::new(SessionShared {
                headers: RwLock::new(headers),
                ..SessionShared::default()
            }),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Snapshot of the default headers.
    pub fn headers(&self) -> RequestHeaders {
        self.shared
            .headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the default headers for subsequent requests.
    pub fn set_headers(&self, headers: RequestHeaders) {
        *self
            .shared
            .headers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = headers;
    }

    /// Overlay `headers` onto the defaults for subsequent requests.
    pub fn merge_headers(&self, headers: &RequestHeaders) {
        let mut current = self
            .shared
            .headers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = current.merge(headers);
    }

    pub fn auth_token(&self) -> Option<String> {
        self.headers().auth_token().map(str::to_string)
    }

    /// Batch mode control for this session.
    pub fn batching(&self) -> Batching {
        Batching::new(self.clone())
    }

    pub(crate) fn batch_queue(&self) -> &BatchQueue {
        &self.shared.batch
    }

    /// Adding the same listener twice has no effect.
    pub fn add_request_listener(&self, listener: Arc<dyn RequestListener>) {
        self.shared.request_listeners.add(listener);
    }

    pub fn remove_request_listener(&self, listener: &Arc<dyn RequestListener>) {
        self.shared.request_listeners.remove(listener);
    }

    /// Adding the same listener twice has no effect.
    pub fn add_subscription_creation_listener(
        &self,
        listener: Arc<dyn SubscriptionCreationListener>,
    ) {
        self.shared.creation_listeners.add(listener);
    }

    pub fn remove_subscription_creation_listener(
        &self,
        listener: &Arc<dyn SubscriptionCreationListener>,
    ) {
        self.shared.creation_listeners.remove(listener);
    }

    /// Issue a request with per-call headers layered over the defaults. In
    /// batch mode the request is queued until the next flush.
    pub fn request<T: ServiceType>(
        &self,
        verb: Verb,
        payload: &T,
        headers: &RequestHeaders,
    ) -> Promise<Response<T>> {
        let request = match ServiceRequest::new(verb, payload, self.headers().merge(headers)) {
            Ok(request) => request,
            Err(e) => return Promise::err(e),
        };
        let observed = (!self.shared.request_listeners.is_empty()).then(|| request.payload.clone());

        let response = match self.shared.batch.route(T::SERVICE, request) {
            Routed::Queued(response) => response,
            Routed::Direct(request) => self.connection.send(T::SERVICE, request),
        };
        if let Some(payload) = observed {
            self.notify_request(verb, T::SERVICE, &payload, &response);
        }
        response.transform(Response::decode)
    }

    fn notify_request(
        &self,
        verb: Verb,
        service: &str,
        payload: &Value,
        response: &Promise<ServiceResponse>,
    ) {
        let listeners = self.shared.request_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let untyped: Promise<Response<Value>> = response.transform(Response::decode);
        for listener in listeners {
            listener.on_request(verb, service, payload, untyped.clone());
        }
    }

    pub fn get<T: ServiceType>(&self, payload: &T) -> Promise<Response<T>> {
        self.request(Verb::Get, payload, &RequestHeaders::new())
    }

    pub fn delete<T: ServiceType>(&self, payload: &T) -> Promise<Response<T>> {
        self.request(Verb::Delete, payload, &RequestHeaders::new())
    }

    pub fn post<T: ServiceType>(&self, payload: &T) -> Promise<Response<T>> {
        self.request(Verb::Post, payload, &RequestHeaders::new())
    }

    pub fn put<T: ServiceType>(&self, payload: &T) -> Promise<Response<T>> {
        self.request(Verb::Put, payload, &RequestHeaders::new())
    }

    fn subscribed(subscription: &Subscription<impl ServiceType>) -> RequestHeaders {
        RequestHeaders::new().with_subscribe_queue(subscription.id())
    }

    pub fn get_with_subscription<T: ServiceType>(
        &self,
        payload: &T,
        subscription: &Subscription<T>,
    ) -> Promise<Response<T>> {
        self.request(Verb::Get, payload, &Self::subscribed(subscription))
    }

    pub fn delete_with_subscription<T: ServiceType>(
        &self,
        payload: &T,
        subscription: &Subscription<T>,
    ) -> Promise<Response<T>> {
        self.request(Verb::Delete, payload, &Self::subscribed(subscription))
    }

    pub fn post_with_subscription<T: ServiceType>(
        &self,
        payload: &T,
        subscription: &Subscription<T>,
    ) -> Promise<Response<T>> {
        self.request(Verb::Post, payload, &Self::subscribed(subscription))
    }

    pub fn put_with_subscription<T: ServiceType>(
        &self,
        payload: &T,
        subscription: &Subscription<T>,
    ) -> Promise<Response<T>> {
        self.request(Verb::Put, payload, &Self::subscribed(subscription))
    }

    /// New, unstarted subscription for `T` events. Subscription creation
    /// listeners hear about it before it is returned.
    pub async fn subscribe<T: ServiceType>(&self) -> Result<Subscription<T>, ClientError> {
        let subscription = self.connection.subscribe::<T>().await?;
        for listener in self.shared.creation_listeners.snapshot() {
            listener.on_subscription_created(subscription.binding());
        }
        Ok(subscription)
    }

    /// Integrity poll plus subscription in one call. The subscription is
    /// cancelled if the poll fails.
    pub async fn get_and_subscribe<T: ServiceType>(
        &self,
        payload: &T,
    ) -> Result<SubscriptionResult<T>, ClientError> {
        let subscription = self.subscribe::<T>().await?;
        let polled = self
            .get_with_subscription(payload, &subscription)
            .many()
            .wait()
            .await;
        match polled {
            Ok(result) => Ok(SubscriptionResult {
                result,
                subscription,
            }),
            Err(e) => {
                subscription.cancel();
                Err(e)
            }
        }
    }

    /// Revoke this session's token. The session keeps working for requests
    /// that do not need authentication.
    pub async fn logout(&self) -> Result<(), ClientError> {
        use crate::application::AuthToken;

        let Some(token) = self.auth_token() else {
            return Ok(());
        };
        let response = self
            .request(Verb::Delete, &AuthToken::revoke(&token), &RequestHeaders::new())
            .wait()
            .await?;
        if !response.is_success() {
            return Err(ClientError::from_status(
                response.status(),
                response.error_message().to_string(),
            ));
        }
        self.set_headers(self.headers().without_auth_token());
        debug!("Session logged out");
        Ok(())
    }
}
