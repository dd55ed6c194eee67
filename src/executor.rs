//! Bounded-concurrency job executor.
//!
//! Fan-out primitive for the storage-facing halves of backup and restore.
//! A fixed pool of worker threads executes submitted closures; results are
//! handed back in completion order. Job failures are captured and yielded
//! as values, and the consumer decides whether to skip or abort.
//!
//! # Backpressure modes
//!
//! - **blocking-submit** (writes): `submit` blocks once `2W + 1` jobs are
//!   outstanding, bounding the number of in-memory blocks waiting for
//!   upload.
//! - **non-blocking-submit** (reads): submission is unbounded; a worker
//!   must take a slot before running a job, and the slot is only returned
//!   when the consumer collects the result. At most `2W + 1` completed
//!   but uncollected results exist, bounding read-ahead.
//!
//! The limit is twice the worker count plus one so workers never starve
//! even when every in-flight job completes at the same moment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{Result, VaultError};

type Job<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

// ── Semaphore ────────────────────────────────────────────────────────────────

/// Counting semaphore. Small enough that hand-rolling beats pulling in a
/// runtime for one primitive.
struct Semaphore {
    permits:   Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self { permits: Mutex::new(permits), available: Condvar::new() }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.available.notify_one();
    }
}

// ── JobExecutor ──────────────────────────────────────────────────────────────

pub struct JobExecutor<T: Send + 'static> {
    name:            String,
    blocking_submit: bool,
    semaphore:       Arc<Semaphore>,
    cancelled:       Arc<AtomicBool>,
    job_tx:          Option<Sender<Job<T>>>,
    result_rx:       Receiver<Result<T>>,
    workers:         Vec<JoinHandle<()>>,
    outstanding:     usize,
}

impl<T: Send + 'static> JobExecutor<T> {
    pub fn new(name: &str, workers: usize, blocking_submit: bool) -> Self {
        let workers_count = workers.max(1);
        let semaphore = Arc::new(Semaphore::new(2 * workers_count + 1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (job_tx, job_rx) = unbounded::<Job<T>>();
        let (result_tx, result_rx) = unbounded::<Result<T>>();

        let mut handles = Vec::with_capacity(workers_count);
        for worker_id in 0..workers_count {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancelled = Arc::clone(&cancelled);
            let thread_name = format!("{name}-{worker_id}");
            let executor_name = name.to_string();
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        // Non-blocking mode takes its slot here; blocking
                        // mode took it in submit().
                        if !blocking_submit {
                            semaphore.acquire();
                        }
                        let result = if cancelled.load(Ordering::Acquire) {
                            Err(VaultError::Internal(format!(
                                "Job executor {executor_name} was cancelled."
                            )))
                        } else {
                            job()
                        };
                        if blocking_submit {
                            semaphore.release();
                        }
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                })
                .unwrap_or_else(|e| panic!("Failed to spawn worker thread: {e}"));
            handles.push(handle);
        }

        Self {
            name: name.to_string(),
            blocking_submit,
            semaphore,
            cancelled,
            job_tx: Some(job_tx),
            result_rx,
            workers: handles,
            outstanding: 0,
        }
    }

    /// Queue a job. In blocking-submit mode this waits for a free slot.
    pub fn submit<F>(&mut self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let tx = self.job_tx.as_ref().ok_or_else(|| {
            VaultError::Internal(format!("Job executor {} is shut down.", self.name))
        })?;
        if self.blocking_submit {
            self.semaphore.acquire();
        }
        self.outstanding += 1;
        tx.send(Box::new(job)).map_err(|_| {
            VaultError::Internal(format!("Job executor {} lost its workers.", self.name))
        })
    }

    /// Number of submitted jobs whose results have not been collected.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Next result in completion order. Blocks while jobs are in flight;
    /// returns `None` once nothing is outstanding.
    pub fn completed(&mut self) -> Option<Result<T>> {
        if self.outstanding == 0 {
            return None;
        }
        let result = match self.result_rx.recv() {
            Ok(r) => r,
            Err(_) => Err(VaultError::Internal(format!(
                "Job executor {} lost its workers.",
                self.name
            ))),
        };
        self.collect_one();
        Some(result)
    }

    /// Like [`completed`](Self::completed) but never blocks.
    pub fn try_completed(&mut self) -> Option<Result<T>> {
        if self.outstanding == 0 {
            return None;
        }
        match self.result_rx.try_recv() {
            Ok(r) => {
                self.collect_one();
                Some(r)
            }
            Err(_) => None,
        }
    }

    fn collect_one(&mut self) {
        self.outstanding -= 1;
        // Collecting a result is what frees a read-ahead slot.
        if !self.blocking_submit {
            self.semaphore.release();
        }
    }

    /// Cancel outstanding jobs and drain their results so no semaphore
    /// slot leaks. Idempotent; also invoked on drop.
    pub fn shutdown(&mut self) {
        if self.job_tx.is_none() {
            return;
        }
        if self.outstanding > 0 {
            warn!(
                executor = %self.name,
                outstanding = self.outstanding,
                "Shutting down with outstanding jobs, cancelling them"
            );
        }
        self.cancelled.store(true, Ordering::Release);
        self.job_tx = None;
        while self.outstanding > 0 {
            let _ = self.completed();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!(executor = %self.name, "Job executor shut down");
    }
}

impl<T: Send + 'static> Drop for JobExecutor<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
