use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::DeliveryError;

type Listener<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;

enum State<T, E> {
    Pending(Vec<Listener<T, E>>),
    Done(Result<T, E>),
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    ready: Condvar,
    notify: Notify,
}

/// Single-assignment result cell for asynchronous sends.
///
/// Completes exactly once; later `set_*` calls return `false`. Listeners run
/// once, on the completing thread, or immediately if added after completion.
/// Can be awaited or blocked on.
pub struct Promise<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Default for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn set_success(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn set_failure(&self, error: E) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, result: Result<T, E>) -> bool {
        let listeners = {
            let mut state = self.shared.state.lock();
            let listeners = match &mut *state {
                State::Done(_) => return false,
                State::Pending(listeners) => mem::take(listeners),
            };
            *state = State::Done(result.clone());
            listeners
        };
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        for listener in listeners {
            listener(&result);
        }
        true
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Done(_))
    }

    #[must_use]
    pub fn try_get(&self) -> Option<Result<T, E>> {
        match &*self.shared.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    pub fn add_listener(&self, listener: impl FnOnce(&Result<T, E>) + Send + 'static) {
        let done = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        listener(&done);
    }

    /// Blocks the calling thread until completion or `timeout`.
    ///
    /// Do not call from inside an async task; use [`Promise::wait`] there.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Failed`] carries the failure value;
    /// [`DeliveryError::Timeout`] means the deadline passed first.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T, DeliveryError<E>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone().map_err(DeliveryError::Failed);
            }
            match deadline {
                None => self.shared.ready.wait(&mut state),
                Some(deadline) => {
                    if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                        if let State::Done(result) = &*state {
                            return result.clone().map_err(DeliveryError::Failed);
                        }
                        return Err(DeliveryError::Timeout {
                            timeout_ms: timeout.map_or(0, millis),
                        });
                    }
                }
            }
        }
    }

    /// Waits asynchronously for completion.
    pub async fn wait(&self) -> Result<T, E> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.try_get() {
                return result;
            }
            notified.await;
        }
    }

    /// # Errors
    ///
    /// As [`Promise::get`].
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, DeliveryError<E>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map_err(DeliveryError::Failed),
            Err(_) => Err(DeliveryError::Timeout {
                timeout_ms: millis(timeout),
            }),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
