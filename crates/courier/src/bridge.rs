//! Bridges a blocking caller onto the async interior.
//!
//! This is the only place the crate exposes thread-blocking behavior; the
//! async core stays pure and the runtime handle is explicit configuration
//! rather than an ambient singleton.

use std::future::Future;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct AwaitBridge {
    handle: Handle,
}

impl AwaitBridge {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Captures the ambient runtime, for callers already inside one.
    pub fn current() -> Result<Self, Error> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::client("no tokio runtime available"))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `future` on the runtime and parks the calling thread until it
    /// resolves or `deadline` elapses, whichever comes first.
    ///
    /// On a deadline the future is NOT cancelled: it keeps running on the
    /// runtime and its result is discarded. Cancellation, where wanted, is
    /// the caller's own move.
    ///
    /// Callable from any thread. A caller already sitting on a worker of
    /// this same runtime is serialized through
    /// [`tokio::task::block_in_place`], which hands the worker's driver
    /// duties to a peer before the thread parks, so the spawned future
    /// still gets polled. The one shape that cannot work — a caller on the
    /// single thread of a current-thread runtime, where parking would stop
    /// the only driver — is rejected up front with [`Error::Client`]
    /// instead of hanging.
    pub fn block_on<F>(
        &self,
        operation: &str,
        deadline: Option<Duration>,
        future: F,
    ) -> Result<F::Output, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let on_own_runtime = match Handle::try_current() {
            Ok(current) if current.id() == self.handle.id() => {
                if current.runtime_flavor() == RuntimeFlavor::CurrentThread {
                    return Err(Error::client(format!(
                        "cannot block on {operation} from inside a current-thread runtime; \
                         call from another thread or use the async Manager"
                    )));
                }
                true
            }
            _ => false,
        };

        let (tx, rx) = std::sync::mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });

        let parked = if on_own_runtime {
            tokio::task::block_in_place(|| park(&rx, deadline))
        } else {
            park(&rx, deadline)
        };

        match parked {
            Park::Value(value) => Ok(value),
            Park::Deadline(limit) => Err(Error::timeout(operation, limit)),
            Park::RuntimeGone => Err(Error::client(format!(
                "runtime dropped while waiting for {operation}"
            ))),
        }
    }
}

enum Park<T> {
    Value(T),
    Deadline(Duration),
    RuntimeGone,
}

fn park<T>(rx: &Receiver<T>, deadline: Option<Duration>) -> Park<T> {
    match deadline {
        Some(limit) => match rx.recv_timeout(limit) {
            Ok(value) => Park::Value(value),
            Err(RecvTimeoutError::Timeout) => Park::Deadline(limit),
            Err(RecvTimeoutError::Disconnected) => Park::RuntimeGone,
        },
        None => match rx.recv() {
            Ok(value) => Park::Value(value),
            Err(_) => Park::RuntimeGone,
        },
    }
}
