//! Main-thread job queue.
//!
//! Connection handlers never run user callbacks themselves. They post jobs
//! here and whichever thread owns the UI drains the queue, either from its
//! own loop ([`MainThreadQueue::run_until`]) or between wait slices of a
//! pending request ([`EventPump`]).

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Hook run between wait slices while a caller is blocked on a response.
pub trait EventPump: Send + Sync {
    fn pump(&self);
}

/// Cloneable handle for posting jobs from any task.
#[derive(Clone)]
pub struct MainThreadSender {
    tx: mpsc::UnboundedSender<Job>,
}

impl MainThreadSender {
    /// Returns false if the queue has been dropped.
    pub fn post(&self, job: Job) -> bool {
        self.tx.send(job).is_ok()
    }
}

pub struct MainThreadQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainThreadQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> MainThreadSender {
        MainThreadSender {
            tx: self.tx.clone(),
        }
    }

    pub fn post(&self, job: Job) {
        // Receiver lives in self, so this cannot fail.
        let _ = self.tx.send(job);
    }

    /// Run every job queued so far without waiting. Returns how many ran.
    ///
    /// Re-entrant calls (a job that itself waits on a request) find the queue
    /// already being drained and return 0.
    pub fn run_pending(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut ran = 0;
        while let Ok(job) = rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }

    /// Run jobs as they arrive until `shutdown` fires.
    pub async fn run_until(&self, shutdown: CancellationToken) {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => run_job(job),
                    None => break,
                },
            }
        }
    }
}

impl EventPump for MainThreadQueue {
    fn pump(&self) {
        let ran = self.run_pending();
        if ran > 0 {
            tracing::trace!(jobs = ran, "Pumped main-thread jobs");
        }
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("Main-thread job panicked");
    }
}
