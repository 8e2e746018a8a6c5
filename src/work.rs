//! Deferred work execution and load-completion signalling.
//!
//! Two pieces the lifecycle manager builds on:
//!
//! - [`WorkQueue`] - a single worker thread executing queued single-shot
//!   jobs in FIFO order, plus jobs scheduled to run after a delay.  Fault
//!   handlers running in interrupt-ish context queue their notification
//!   fan-out here instead of doing it inline, and aborted suspend attempts
//!   schedule their retry here.
//! - [`Completion`] - a one-shot broadcast signal.  The asynchronous
//!   firmware load publishes through it; every `put()` waits on it before
//!   touching the processor.
//!
//! Queueing a job takes a short internal lock only; nothing here ever holds
//! a lock while a job runs.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded deferred-work queue.
///
/// Dropping the queue shuts it down: already-queued immediate jobs are
/// drained, pending delayed jobs are discarded.
pub struct WorkQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<QueueState>,
    cv: Condvar,
}

struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    down: bool,
}

impl WorkQueue {
    /// Create the queue and spawn its worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the worker thread cannot be spawned.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                delayed: Vec::new(),
                down: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("rproc-work".into())
            .spawn(move || worker_shared.run())
            .map_err(|e| {
                error!("can't spawn work queue thread: {e}");
                Error::Io
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `job` for execution as soon as the worker is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after [`WorkQueue::shutdown()`].
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.enqueue(None, Box::new(job))
    }

    /// Queue `job` for execution no earlier than `delay` from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after [`WorkQueue::shutdown()`].
    pub fn queue_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.enqueue(Some(delay), Box::new(job))
    }

    fn enqueue(&self, delay: Option<Duration>, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.down {
            return Err(Error::ShuttingDown);
        }

        match delay {
            None => state.ready.push_back(job),
            Some(d) => state.delayed.push((Instant::now() + d, job)),
        }

        self.shared.cv.notify_one();
        Ok(())
    }

    /// Stop accepting work, drain already-queued immediate jobs, discard
    /// pending delayed jobs, and join the worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.down {
                return;
            }
            state.down = true;
            state.delayed.clear();
            self.shared.cv.notify_all();
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.thread().id() == thread::current().id() {
                // shutdown from inside a queued job; the worker exits on
                // its own once the queue drains
                return;
            }
            let _ = worker.join();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        let mut state = self.state.lock().unwrap();

        loop {
            let now = Instant::now();
            let mut i = 0;
            while i < state.delayed.len() {
                if state.delayed[i].0 <= now {
                    let (_, job) = state.delayed.swap_remove(i);
                    state.ready.push_back(job);
                } else {
                    i += 1;
                }
            }

            if let Some(job) = state.ready.pop_front() {
                drop(state);
                job();
                state = self.state.lock().unwrap();
                continue;
            }

            if state.down {
                break;
            }

            state = match state.delayed.iter().map(|(due, _)| *due).min() {
                Some(due) => {
                    let timeout = due.saturating_duration_since(Instant::now());
                    self.cv.wait_timeout(state, timeout).unwrap().0
                }
                None => self.cv.wait(state).unwrap(),
            };
        }
    }
}

/// One-shot broadcast signal.
///
/// Starts incomplete (or already fired, via [`Completion::completed()`]);
/// [`Completion::complete_all()`] releases every current and future waiter.
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    /// A completion that has not fired yet.
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// A completion that has already fired; waiters return immediately.
    pub fn completed() -> Self {
        Self {
            done: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    /// Fire the completion, releasing all waiters.
    pub fn complete_all(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Block until the completion fires.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    /// Whether the completion has fired.
    pub fn is_complete(&self) -> bool {
        *self.done.lock().unwrap()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
