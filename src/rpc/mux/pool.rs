//! Fixed size pool of threads pulling jobs from one shared queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

/// How long an idle worker waits before checking whether the pool stopped.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `size` workers, at least one.
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = flume::unbounded::<Job>();
        let stopped = Arc::new(AtomicBool::new(false));

        let workers = (0..size.max(1))
            .filter_map(|index| {
                let receiver = receiver.clone();
                let stopped = stopped.clone();

                thread::Builder::new()
                    .name(format!("kadnet-worker-{index}"))
                    .spawn(move || work(receiver, stopped))
                    .map_err(|error| debug!(context = "mux", ?error, "Failed to spawn worker"))
                    .ok()
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            stopped,
        }
    }

    /// Returns a handle queueing jobs into this pool.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            sender: self.sender.clone(),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking queued jobs and wait for the running ones to finish.
    ///
    /// Jobs still in the queue are dropped.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.sender = None;

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                debug!(context = "mux", "Worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Queues jobs into a [WorkerPool].
#[derive(Debug, Clone)]
pub struct Submitter {
    sender: Option<Sender<Job>>,
}

impl Submitter {
    /// Never blocks; returns false if the pool is gone.
    pub fn submit(&self, job: Job) -> bool {
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    pub fn queued(&self) -> usize {
        self.sender.as_ref().map(|sender| sender.len()).unwrap_or(0)
    }
}

fn work(receiver: Receiver<Job>, stopped: Arc<AtomicBool>) {
    while !stopped.load(Ordering::Acquire) {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(job) if !stopped.load(Ordering::Acquire) => job(),
            Ok(_) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
