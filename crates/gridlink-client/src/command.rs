// ABOUTME: Command execution: wire types, correlation tracker with deadline sweep, dispatcher and adapter binding.
// ABOUTME: Every tracked execution ends with exactly one status; late results after a timeout are rejected.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::envelope::{ServiceRequest, Status, Verb};
use crate::error::ClientError;
use crate::headers::{RequestHeaders, Routing};
use crate::promise::{Completer, Promise, PromiseResult};
use crate::service::{ResponseCallback, Service, ServiceBinding, ServiceRegistration};
use crate::session::{Response, ServiceType, Session};

/// Default time a command may take before it resolves with TIMEOUT.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Extra time a client waits for the relay's reply beyond the command timeout.
const REPLY_GRACE: Duration = Duration::from_millis(1000);

fn default_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

/// Outcome of a command. Everything except `Executing` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Success,
    Timeout,
    NoSelect,
    FormatError,
    NotSupported,
    AlreadyActive,
    HardwareError,
    Local,
    TooManyOps,
    NotAuthorized,
    Undefined,
    /// Progress report; the command is still running.
    Executing,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        self != CommandStatus::Executing
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Success => "SUCCESS",
            CommandStatus::Timeout => "TIMEOUT",
            CommandStatus::NoSelect => "NO_SELECT",
            CommandStatus::FormatError => "FORMAT_ERROR",
            CommandStatus::NotSupported => "NOT_SUPPORTED",
            CommandStatus::AlreadyActive => "ALREADY_ACTIVE",
            CommandStatus::HardwareError => "HARDWARE_ERROR",
            CommandStatus::Local => "LOCAL",
            CommandStatus::TooManyOps => "TOO_MANY_OPS",
            CommandStatus::NotAuthorized => "NOT_AUTHORIZED",
            CommandStatus::Undefined => "UNDEFINED",
            CommandStatus::Executing => "EXECUTING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandType {
    Int,
    Double,
    None,
}

/// Setpoint carried by a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandValue {
    Int(i64),
    Double(f64),
    None,
}

/// A command as sent to the adapter that executes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub int_val: i64,
    #[serde(default)]
    pub double_val: f64,
}

impl ServiceType for CommandRequest {
    const SERVICE: &'static str = "command_request";
}

impl CommandRequest {
    pub fn new(name: impl Into<String>, value: CommandValue) -> Self {
        let (command_type, int_val, double_val) = match value {
            CommandValue::Int(v) => (CommandType::Int, v, 0.0),
            CommandValue::Double(v) => (CommandType::Double, 0, v),
            CommandValue::None => (CommandType::None, 0, 0.0),
        };
        Self {
            name: name.into(),
            correlation_id: String::new(),
            command_type,
            int_val,
            double_val,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn value(&self) -> CommandValue {
        match self.command_type {
            CommandType::Int => CommandValue::Int(self.int_val),
            CommandType::Double => CommandValue::Double(self.double_val),
            CommandType::None => CommandValue::None,
        }
    }
}

/// The adapter's answer to a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub correlation_id: String,
    pub status: CommandStatus,
}

/// Client-facing command envelope. `status` and `user` are filled in by the
/// service tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCommandRequest {
    #[serde(default)]
    pub uid: String,
    pub command_request: CommandRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ServiceType for UserCommandRequest {
    const SERVICE: &'static str = "user_command_request";
}

impl UserCommandRequest {
    pub fn new(command_request: CommandRequest, timeout: Duration) -> Self {
        Self {
            uid: String::new(),
            command_request,
            status: None,
            user: None,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

type DeadlineKey = (Instant, u64);

enum ExecutionState {
    Open(Completer<CommandStatus>),
    Resolved(CommandStatus),
    Failed,
    TimedOut,
}

struct ExecutionInner {
    correlation_id: String,
    name: String,
    user: Option<String>,
    timeout: Duration,
    deadline: DeadlineKey,
    state: Mutex<ExecutionState>,
    tracker: Weak<TrackerInner>,
}

impl ExecutionInner {
    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move out of Open and complete the promise. Errors if already final.
    fn finish(
        &self,
        result: PromiseResult<CommandStatus>,
        next: ExecutionState,
    ) -> Result<(), ClientError> {
        let completer = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, next) {
                ExecutionState::Open(completer) => completer,
                previous => {
                    let err = match previous {
                        ExecutionState::TimedOut => ClientError::CommandTimeout {
                            correlation_id: self.correlation_id.clone(),
                        },
                        _ => ClientError::ProtocolViolation(format!(
                            "command {} already has a result",
                            self.correlation_id
                        )),
                    };
                    *state = previous;
                    return Err(err);
                }
            }
        };
        completer.complete(result);
        Ok(())
    }
}

/// Handle to one outstanding command. The adapter side sets the result
/// through it exactly once.
#[derive(Clone)]
pub struct CommandExecution {
    inner: Arc<ExecutionInner>,
}

impl fmt::Debug for CommandExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecution")
            .field("correlation_id", &self.inner.correlation_id)
            .field("name", &self.inner.name)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl CommandExecution {
    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn user(&self) -> Option<&str> {
        self.inner.user.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.inner.state(), ExecutionState::Open(_))
    }

    /// The final status, once there is one. A failed execution has none.
    pub fn result(&self) -> Option<CommandStatus> {
        match *self.inner.state() {
            ExecutionState::Resolved(status) => Some(status),
            ExecutionState::TimedOut => Some(CommandStatus::Timeout),
            ExecutionState::Open(_) | ExecutionState::Failed => None,
        }
    }

    /// Record the final status.
    ///
    /// `Executing` is not final and is rejected, as is a second result. A
    /// result after the timeout fired yields `CommandTimeout`.
    pub fn set_command_result(&self, status: CommandStatus) -> Result<(), ClientError> {
        if !status.is_terminal() {
            error!(correlation_id = %self.inner.correlation_id, "EXECUTING is not a command result");
            return Err(ClientError::ProtocolViolation(format!(
                "{status} is not a final command status"
            )));
        }
        match self
            .inner
            .finish(Ok(status), ExecutionState::Resolved(status))
        {
            Ok(()) => {
                if let Some(tracker) = self.inner.tracker.upgrade() {
                    tracker.forget(&self.inner);
                }
                debug!(correlation_id = %self.inner.correlation_id, %status, "Command completed");
                Ok(())
            }
            Err(e @ ClientError::CommandTimeout { .. }) => {
                warn!(
                    correlation_id = %self.inner.correlation_id,
                    %status,
                    "Discarding command result that arrived after timeout"
                );
                Err(e)
            }
            Err(e) => {
                error!(correlation_id = %self.inner.correlation_id, error = %e, "Duplicate command result");
                Err(e)
            }
        }
    }
}

/// What `track` hands back.
#[derive(Debug)]
pub struct TrackedCommand {
    /// The request with its correlation id filled in.
    pub request: CommandRequest,
    pub execution: CommandExecution,
    pub result: Promise<CommandStatus>,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, Arc<ExecutionInner>>,
    deadlines: BTreeMap<DeadlineKey, String>,
    seq: u64,
}

struct TrackerInner {
    tables: Mutex<Tables>,
    wake: Notify,
    cancel: CancellationToken,
}

impl TrackerInner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `execution`'s entries. The id may already belong to a newer
    /// execution, which must stay tracked.
    fn forget(&self, execution: &Arc<ExecutionInner>) {
        let mut tables = self.tables();
        let owned = tables
            .by_id
            .get(&execution.correlation_id)
            .is_some_and(|current| Arc::ptr_eq(current, execution));
        if owned {
            tables.by_id.remove(&execution.correlation_id);
        }
        tables.deadlines.remove(&execution.deadline);
    }

    fn take(&self, correlation_id: &str) -> Option<Arc<ExecutionInner>> {
        let mut tables = self.tables();
        let execution = tables.by_id.remove(correlation_id)?;
        tables.deadlines.remove(&execution.deadline);
        Some(execution)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.tables()
            .deadlines
            .first_key_value()
            .map(|((at, _), _)| *at)
    }

    fn expire(&self, now: Instant) {
        let expired: Vec<Arc<ExecutionInner>> = {
            let mut tables = self.tables();
            let mut expired = Vec::new();
            while let Some(entry) = tables.deadlines.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let id = entry.remove();
                if let Some(execution) = tables.by_id.remove(&id) {
                    expired.push(execution);
                }
            }
            expired
        };
        for execution in expired {
            if execution
                .finish(Ok(CommandStatus::Timeout), ExecutionState::TimedOut)
                .is_ok()
            {
                warn!(
                    correlation_id = %execution.correlation_id,
                    command = %execution.name,
                    timeout_ms = execution.timeout.as_millis() as u64,
                    "Command timed out"
                );
            }
        }
    }
}

async fn sweep(inner: Arc<TrackerInner>) {
    loop {
        let next = inner.next_deadline();
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = async {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
        inner.expire(Instant::now());
    }
}

/// Correlates outstanding commands with their results and times them out.
pub struct CommandTracker {
    inner: Arc<TrackerInner>,
}

impl fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTracker")
            .field("open", &self.open_count())
            .finish()
    }
}

impl CommandTracker {
    /// The timeout sweep runs on `handle` until the tracker is dropped or closed.
    pub fn new(handle: &Handle) -> Self {
        let inner = Arc::new(TrackerInner {
            tables: Mutex::new(Tables::default()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });
        handle.spawn(sweep(Arc::clone(&inner)));
        Self { inner }
    }

    /// Start tracking `request`. An empty correlation id gets a fresh one; an
    /// id that is already outstanding is rejected.
    pub fn track(
        &self,
        mut request: CommandRequest,
        user: Option<String>,
        timeout: Duration,
    ) -> Result<TrackedCommand, ClientError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::IllegalState(
                "command tracker is closed".to_string(),
            ));
        }
        if request.correlation_id.is_empty() {
            request.correlation_id = Uuid::new_v4().to_string();
        }

        let (result, completer) = Promise::pending();
        let execution = {
            let mut tables = self.inner.tables();
            if tables.by_id.contains_key(&request.correlation_id) {
                error!(correlation_id = %request.correlation_id, "Duplicate outstanding command id");
                return Err(ClientError::ProtocolViolation(format!(
                    "command {} is already outstanding",
                    request.correlation_id
                )));
            }
            tables.seq += 1;
            let deadline = (Instant::now() + timeout, tables.seq);
            let execution = Arc::new(ExecutionInner {
                correlation_id: request.correlation_id.clone(),
                name: request.name.clone(),
                user,
                timeout,
                deadline,
                state: Mutex::new(ExecutionState::Open(completer)),
                tracker: Arc::downgrade(&self.inner),
            });
            tables
                .by_id
                .insert(request.correlation_id.clone(), Arc::clone(&execution));
            tables
                .deadlines
                .insert(deadline, request.correlation_id.clone());
            execution
        };
        self.inner.wake.notify_one();

        debug!(
            correlation_id = %request.correlation_id,
            command = %request.name,
            timeout_ms = timeout.as_millis() as u64,
            "Tracking command"
        );
        Ok(TrackedCommand {
            request,
            execution: CommandExecution { inner: execution },
            result,
        })
    }

    /// Deliver an adapter's response by correlation id. `Executing` keeps
    /// the command open. False if nothing is waiting for this id.
    pub fn resolve(&self, response: &CommandResponse) -> bool {
        if response.status == CommandStatus::Executing {
            let open = self
                .inner
                .tables()
                .by_id
                .contains_key(&response.correlation_id);
            debug!(correlation_id = %response.correlation_id, open, "Command still executing");
            return open;
        }
        let execution = self
            .inner
            .tables()
            .by_id
            .get(&response.correlation_id)
            .cloned();
        match execution {
            Some(inner) => CommandExecution { inner }
                .set_command_result(response.status)
                .is_ok(),
            None => {
                warn!(
                    correlation_id = %response.correlation_id,
                    status = %response.status,
                    "Response for unknown or expired command"
                );
                false
            }
        }
    }

    /// Resolve a command with an error, e.g. when it could not be sent.
    pub fn fail(&self, correlation_id: &str, error: ClientError) -> bool {
        match self.inner.take(correlation_id) {
            Some(execution) => {
                warn!(correlation_id, error = %error, "Command failed");
                execution.finish(Err(error), ExecutionState::Failed).is_ok()
            }
            None => false,
        }
    }

    pub fn open_count(&self) -> usize {
        self.inner.tables().by_id.len()
    }

    /// Stop the sweep and fail everything still open.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let open: Vec<Arc<ExecutionInner>> = {
            let mut tables = self.inner.tables();
            tables.deadlines.clear();
            tables.by_id.drain().map(|(_, e)| e).collect()
        };
        for execution in open {
            let _ = execution.finish(
                Err(ClientError::NotConnected("command tracker closed".to_string())),
                ExecutionState::Failed,
            );
        }
    }
}

impl Drop for CommandTracker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Issuing side: sends commands to adapters and tracks their responses.
#[derive(Clone)]
pub struct CommandDispatcher {
    connection: Connection,
    tracker: Arc<CommandTracker>,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("connection", &self.connection)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new(connection: Connection) -> Self {
        let tracker = Arc::new(CommandTracker::new(connection.handle()));
        Self {
            connection,
            tracker,
        }
    }

    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }

    pub fn dispatch(
        &self,
        name: &str,
        value: CommandValue,
        destination: &Routing,
        timeout: Duration,
    ) -> Result<Promise<CommandStatus>, ClientError> {
        self.dispatch_request(CommandRequest::new(name, value), None, destination, timeout)
    }

    /// Send a prepared request on behalf of `user`.
    pub fn dispatch_request(
        &self,
        request: CommandRequest,
        user: Option<String>,
        destination: &Routing,
        timeout: Duration,
    ) -> Result<Promise<CommandStatus>, ClientError> {
        self.connection.ensure_open()?;
        let tracked = self.tracker.track(request, user, timeout)?;
        let correlation_id = tracked.request.correlation_id.clone();
        info!(
            correlation_id = %correlation_id,
            command = %tracked.request.name,
            destination = %destination.key(),
            "Dispatching command"
        );

        let headers = RequestHeaders::new()
            .with_destination(destination.clone())
            .with_timeout(timeout);
        let reply = self.connection.request::<CommandRequest, CommandResponse>(
            CommandRequest::SERVICE,
            Verb::Post,
            &tracked.request,
            headers,
        );

        let tracker = Arc::clone(&self.tracker);
        reply.listen(move |reply| match reply.and_then(Response::one) {
            Ok(response) => {
                tracker.resolve(&response);
            }
            // The sweep reports TIMEOUT on its own.
            Err(ClientError::ResponseTimeout(_)) => {}
            Err(e) => {
                tracker.fail(&correlation_id, e);
            }
        });
        Ok(tracked.result)
    }
}

/// Client side: issue commands through the service tier.
#[derive(Debug, Clone)]
pub struct CommandService {
    session: Session,
}

impl CommandService {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Resolves with the command's final status. `TIMEOUT` is a status, not
    /// an error.
    pub fn execute(
        &self,
        name: &str,
        value: CommandValue,
        timeout: Duration,
    ) -> Promise<CommandStatus> {
        let request = UserCommandRequest::new(CommandRequest::new(name, value), timeout);
        let headers = RequestHeaders::new().with_timeout(timeout + REPLY_GRACE);
        self.session
            .request(Verb::Post, &request, &headers)
            .one()
            .transform(|reply| {
                reply.status.ok_or_else(|| {
                    ClientError::ProtocolViolation("command reply carried no status".to_string())
                })
            })
    }
}

/// Adapter side: executes commands and reports through the execution handle.
pub trait CommandRequestHandler: Send + Sync + 'static {
    fn handle_command_request(&self, request: CommandRequest, execution: CommandExecution);
}

impl<F> CommandRequestHandler for F
where
    F: Fn(CommandRequest, CommandExecution) + Send + Sync + 'static,
{
    fn handle_command_request(&self, request: CommandRequest, execution: CommandExecution) {
        self(request, execution)
    }
}

/// Service adapter that tracks each inbound command and answers with its status.
struct CommandHandlerService {
    handler: Arc<dyn CommandRequestHandler>,
    tracker: CommandTracker,
    timeout: Duration,
}

impl Service for CommandHandlerService {
    fn respond(&self, request: ServiceRequest, callback: ResponseCallback) {
        let command: CommandRequest = match request.payload_as() {
            Ok(command) => command,
            Err(e) => return callback.fail(&e),
        };
        let tracked = match self.tracker.track(command, None, self.timeout) {
            Ok(tracked) => tracked,
            Err(e) => return callback.fail(&e),
        };

        let correlation_id = tracked.request.correlation_id.clone();
        tracked.result.listen(move |result| match result {
            Ok(status) => callback.succeed(
                Status::Ok,
                &[CommandResponse {
                    correlation_id,
                    status,
                }],
            ),
            Err(e) => callback.fail(&e),
        });
        self.handler
            .handle_command_request(tracked.request, tracked.execution);
    }
}

impl ServiceRegistration {
    /// Bind an adapter's command handler. Commands the handler does not
    /// finish within `timeout` are answered with TIMEOUT.
    pub async fn bind_command_handler(
        &self,
        handler: Arc<dyn CommandRequestHandler>,
        destination: Routing,
        competing: bool,
        timeout: Duration,
    ) -> Result<ServiceBinding, ClientError> {
        let service = CommandHandlerService {
            handler,
            tracker: CommandTracker::new(self.connection().handle()),
            timeout,
        };
        self.bind_service::<CommandRequest>(Arc::new(service), destination, competing)
            .await
    }
}
