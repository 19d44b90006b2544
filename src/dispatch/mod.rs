//! Dispatch bridge: run host-only functions on the host thread.
//!
//! The host (a Bevy `World`, an in-memory scene, ...) may only be touched
//! from its own thread. Worker threads package a closure as a job, push it
//! onto a shared FIFO and await a single-slot reply. The host drains the
//! FIFO once per tick and runs every job in enqueue order.
//!
//! Architecture: worker (tokio) ─job→ HostQueue (host thread) ─reply→ worker

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Failure of a dispatched call, as seen by the calling thread.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The host function returned an error. The original error is preserved.
    #[error(transparent)]
    Failed(anyhow::Error),

    /// The host function panicked; the panic was caught on the host thread.
    #[error("host function panicked: {0}")]
    Panicked(String),

    /// The host queue was dropped before the job ran.
    #[error("host is gone, dispatch queue closed")]
    HostGone,

    /// No reply within the configured timeout.
    #[error("host did not run the job within {0:?}")]
    Timeout(Duration),
}

/// A type-erased unit of work for the host thread.
pub struct DispatchJob<H> {
    name: String,
    /// Returns false when the job was dropped without touching the host.
    run: Box<dyn FnOnce(&mut H) -> bool + Send>,
}

/// Producer side. Cheap to clone; callable from any thread.
pub struct Dispatcher<H> {
    tx: mpsc::Sender<DispatchJob<H>>,
    timeout: Option<Duration>,
}

impl<H> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            timeout: self.timeout,
        }
    }
}

impl<H: 'static> Dispatcher<H> {
    /// Bound the wait for every call made through this dispatcher.
    /// `None` waits until the host runs the job or goes away.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `func` on the host thread and wait for its result.
    ///
    /// Returns exactly what `func` returned; an `Err` from `func` comes back
    /// as [`DispatchError::Failed`] wrapping the same error value.
    pub async fn call<R, F>(&self, name: &str, func: F) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        F: FnOnce(&mut H) -> anyhow::Result<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<R, DispatchError>>();

        let job = DispatchJob {
            name: name.to_string(),
            run: Box::new(move |host: &mut H| {
                // A caller that timed out must not see its side effect land later.
                if reply_tx.is_closed() {
                    return false;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || func(host)));
                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(DispatchError::Failed(e)),
                    Err(payload) => Err(DispatchError::Panicked(panic_message(payload.as_ref()))),
                };
                // Caller may have timed out while the job ran.
                let _ = reply_tx.send(result);
                true
            }),
        };

        self.tx.send(job).map_err(|_| DispatchError::HostGone)?;

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| DispatchError::Timeout(limit))?,
            None => reply_rx.await,
        };

        reply.map_err(|_| DispatchError::HostGone)?
    }
}

/// Consumer side, owned by the host thread.
pub struct HostQueue<H> {
    rx: mpsc::Receiver<DispatchJob<H>>,
}

impl<H> HostQueue<H> {
    /// Run every queued job, in FIFO order, against `host`.
    /// Jobs whose caller has already given up are skipped.
    /// Returns the number of jobs executed.
    pub fn drain(&self, host: &mut H) -> usize {
        let mut executed = 0;
        while let Ok(job) = self.rx.try_recv() {
            debug!("Host executing: {}", job.name);
            if (job.run)(host) {
                executed += 1;
            } else {
                debug!("Skipped {}: caller no longer waiting", job.name);
            }
        }
        executed
    }
}

/// Create a matched pair of (Dispatcher for workers, HostQueue for the host).
pub fn dispatch_channel<H>() -> (Dispatcher<H>, HostQueue<H>) {
    let (tx, rx) = mpsc::channel();
    (Dispatcher { tx, timeout: None }, HostQueue { rx })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
