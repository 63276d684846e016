// ABOUTME: Single-assignment deferred result with blocking, async and callback observers.
// ABOUTME: Every request, command execution and derived value in the client resolves through one.

use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::ClientError;

/// Outcome stored in a completed promise.
pub type PromiseResult<T> = Result<T, ClientError>;

type Listener<T> = Box<dyn FnOnce(PromiseResult<T>) + Send + 'static>;

enum Slot<T> {
    Pending(Vec<Listener<T>>),
    Complete(PromiseResult<T>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    notify: Notify,
}

impl<T: Clone> Shared<T> {
    fn new(slot: Slot<T>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(slot),
            ready: Condvar::new(),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peek(&self) -> Option<PromiseResult<T>> {
        match &*self.lock() {
            Slot::Pending(_) => None,
            Slot::Complete(result) => Some(result.clone()),
        }
    }

    /// Store the result and drain the listeners in one critical section,
    /// then run the listeners with the lock released.
    fn complete(&self, result: PromiseResult<T>) -> bool {
        let listeners = {
            let mut slot = self.lock();
            let listeners = match &mut *slot {
                Slot::Complete(_) => return false,
                Slot::Pending(listeners) => mem::take(listeners),
            };
            *slot = Slot::Complete(result.clone());
            self.ready.notify_all();
            listeners
        };
        self.notify.notify_waiters();

        for listener in listeners {
            listener(result.clone());
        }
        true
    }
}

/// Read side of a deferred result. Cheap to clone; all clones observe the
/// same completion.
///
/// `await_result` parks the calling thread. Never call it from a bus
/// delivery callback or a runtime worker; use `wait` or `listen` there.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.shared.peek().is_some())
            .finish()
    }
}

/// Write side of a deferred result. Completing consumes it, so a promise can
/// only ever be set once. Dropping it unset resolves the promise with a
/// transport error so no waiter is stranded.
pub struct Completer<T: Clone + Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A pending promise and the completer that resolves it.
    pub fn pending() -> (Promise<T>, Completer<T>) {
        let shared = Shared::new(Slot::Pending(Vec::new()));
        (
            Promise {
                shared: Arc::clone(&shared),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// An already completed promise.
    pub fn resolved(result: PromiseResult<T>) -> Promise<T> {
        Promise {
            shared: Shared::new(Slot::Complete(result)),
        }
    }

    pub fn ok(value: T) -> Promise<T> {
        Self::resolved(Ok(value))
    }

    pub fn err(error: ClientError) -> Promise<T> {
        Self::resolved(Err(error))
    }

    pub fn is_complete(&self) -> bool {
        self.shared.peek().is_some()
    }

    /// The result if the promise has completed, without blocking.
    pub fn try_result(&self) -> Option<PromiseResult<T>> {
        self.shared.peek()
    }

    /// Block the calling thread until the promise completes.
    pub fn await_result(&self) -> PromiseResult<T> {
        let guard = self
            .shared
            .ready
            .wait_while(self.shared.lock(), |slot| matches!(slot, Slot::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Slot::Complete(result) => result.clone(),
            Slot::Pending(_) => unreachable!("wait_while returned while pending"),
        }
    }

    /// Block for at most `timeout`. `None` means the promise is still pending.
    pub fn await_timeout(&self, timeout: Duration) -> Option<PromiseResult<T>> {
        let (guard, _) = self
            .shared
            .ready
            .wait_timeout_while(self.shared.lock(), timeout, |slot| {
                matches!(slot, Slot::Pending(_))
            })
            .unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Slot::Complete(result) => Some(result.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Wait for completion from async code.
    pub async fn wait(&self) -> PromiseResult<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.shared.peek() {
                return result;
            }
            notified.await;
        }
    }

    /// Register a completion callback. It runs exactly once: on the thread
    /// that completes the promise, or right now if it already has.
    pub fn listen<F>(&self, listener: F)
    where
        F: FnOnce(PromiseResult<T>) + Send + 'static,
    {
        let result = {
            let mut slot = self.shared.lock();
            match &mut *slot {
                Slot::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                Slot::Complete(result) => result.clone(),
            }
        };
        listener(result);
    }

    /// Derive a promise from this one's value. Errors pass through untouched.
    pub fn transform<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> PromiseResult<U> + Send + 'static,
    {
        let (promise, completer) = Promise::pending();
        self.listen(move |result| {
            completer.complete(result.and_then(f));
        });
        promise
    }
}

impl<T: Clone + Send + 'static> Completer<T> {
    /// Resolve the promise. Returns false if it was already resolved.
    pub fn complete(mut self, result: PromiseResult<T>) -> bool {
        match self.shared.take() {
            Some(shared) => shared.complete(result),
            None => false,
        }
    }

    pub fn succeed(self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(self, error: ClientError) -> bool {
        self.complete(Err(error))
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(ClientError::Transport(
                "request abandoned before completion".to_string(),
            )));
        }
    }
}
