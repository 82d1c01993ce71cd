//! Micro-threads on the tokio runtime.
//!
//! Each build step runs as one micro-thread: a named task whose body returns
//! a `BuildResult<()>`. A body that errors or panics does not take the
//! process down. The fault is captured and reported by
//! [`Scheduler::run_until_end`], which the driver treats as fatal.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use crate::error::{BuildError, BuildResult};

/// A micro-thread whose body failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MicroThreadFault {
    pub id: u64,
    pub name: String,
    pub message: String,
}

impl From<MicroThreadFault> for BuildError {
    fn from(fault: MicroThreadFault) -> Self {
        BuildError::MicroThreadFault {
            name: fault.name,
            message: fault.message,
        }
    }
}

struct MicroThread {
    id: u64,
    name: String,
    handle: JoinHandle<BuildResult<()>>,
}

pub struct Scheduler {
    next_id: AtomicU64,
    threads: Mutex<Vec<MicroThread>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Allocate an id for a micro-thread started later. Ids are never 0.
    pub fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start `body` under a previously reserved `id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, id: u64, name: impl Into<String>, body: F)
    where
        F: Future<Output = BuildResult<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(id, name = %name, "micro-thread started");
        let handle = tokio::spawn(body);
        self.threads
            .lock()
            .expect("scheduler lock poisoned")
            .push(MicroThread { id, name, handle });
    }

    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> u64
    where
        F: Future<Output = BuildResult<()>> + Send + 'static,
    {
        let id = self.reserve_id();
        self.start(id, name, body);
        id
    }

    /// Micro-threads started and not yet collected.
    pub fn pending(&self) -> usize {
        self.threads.lock().expect("scheduler lock poisoned").len()
    }

    /// Wait until every micro-thread, including those started while
    /// waiting, has ended. Returns the faults in completion order.
    pub async fn run_until_end(&self) -> Vec<MicroThreadFault> {
        let mut faults = Vec::new();
        loop {
            let batch = std::mem::take(&mut *self.threads.lock().expect("scheduler lock poisoned"));
            if batch.is_empty() {
                break;
            }
            for thread in batch {
                let message = match thread.handle.await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => join_message(e),
                };
                error!(id = thread.id, name = %thread.name, %message, "micro-thread faulted");
                faults.push(MicroThreadFault {
                    id: thread.id,
                    name: thread.name,
                    message,
                });
            }
        }
        faults
    }
}

fn join_message(e: JoinError) -> String {
    if e.is_cancelled() {
        return "cancelled".to_string();
    }
    panic_message(e.into_panic())
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
