//! Caller-owned worker threads that method handlers can be delivered to.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chainerror::*;
use tracing::{debug, error, warn};

use crate::error::*;
use crate::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where method handlers of an object run.
#[derive(Clone, Debug, Default)]
pub enum DeliveryPolicy {
    /// On the thread that reads the connection.
    #[default]
    Inline,
    /// Handed off to a worker; the reading thread continues at once.
    Worker(WorkerHandle),
}

/// Sending side of a worker's queue.
///
/// All clones share one sender; once the worker stops, every clone fails to
/// queue.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: Arc<Mutex<Option<mpsc::Sender<Job>>>>,
    name: Arc<str>,
}

impl WorkerHandle {
    /// Queue `job`; fails once the worker has stopped.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.sender);
        match sender.as_ref() {
            Some(tx) if tx.send(Box::new(job)).is_ok() => Ok(()),
            _ => {
                let reason = format!("worker '{}' has stopped", self.name);
                Err(ErrorKind::Failed(reason).into_error())
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    // Jobs queued so far still reach the receiver.
    fn close(&self) {
        lock(&self.sender).take();
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("name", &self.name).finish()
    }
}

/// Receiving side of a worker's queue, for running jobs on a thread the
/// caller already owns.
pub struct WorkerQueue {
    receiver: mpsc::Receiver<Job>,
    name: Arc<str>,
}

fn run_job(name: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("job on worker '{}' panicked", name);
    }
}

impl WorkerQueue {
    /// Run jobs until the worker is stopped or every handle is gone. Jobs
    /// queued before that still run.
    pub fn run(&self) {
        while let Ok(job) = self.receiver.recv() {
            run_job(&self.name, job);
        }
        debug!("worker '{}' finished", self.name);
    }

    /// Run at most one job, waiting up to `timeout` for it. Returns `false`
    /// once the queue is closed and empty.
    pub fn run_once(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                run_job(&self.name, job);
                true
            }
            Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => true,
        }
    }

    /// Run the jobs already queued without blocking; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(job) => {
                    run_job(&self.name, job);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return n,
            }
        }
    }
}

/// A connected handle and queue; drive the queue with
/// [`WorkerQueue::run`] on a thread of your choice.
pub fn worker_channel(name: &str) -> (WorkerHandle, WorkerQueue) {
    let (sender, receiver) = mpsc::channel();
    let name: Arc<str> = Arc::from(name);
    (
        WorkerHandle {
            sender: Arc::new(Mutex::new(Some(sender))),
            name: name.clone(),
        },
        WorkerQueue { receiver, name },
    )
}

/// A worker thread of its own.
///
/// Dropping it closes the queue: jobs already queued still run, later ones
/// are rejected. The drop waits for the thread unless it happens on that
/// thread.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str) -> Result<Worker> {
        let (handle, queue) = worker_channel(name);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || queue.run())
            .map_context(ErrorKind::from_io)?;
        Ok(Worker {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::Worker(self.handle())
    }

    pub fn thread_id(&self) -> Option<thread::ThreadId> {
        self.thread.as_ref().map(|t| t.thread().id())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.handle.close();

        if let Some(thread) = self.thread.take() {
            // A job may drop the last owner of its own worker.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("worker '{}' thread panicked", self.handle.name);
            }
        }
    }
}
