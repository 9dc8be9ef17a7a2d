//! Worker pools for scheduled and fan-out I/O.
//!
//! [`ScheduledPool`] is a single scheduler thread owning a deadline queue
//! and feeding a fixed set of workers; it backs the timer-flushed write
//! path. [`WorkerPool`] is a plain FIFO pool sized for query fan-out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cancel handle for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(u64);

#[derive(Default)]
struct SchedulerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

/// Delay-scheduled task submission to a bounded worker pool.
///
/// One-shot tasks run on the workers once their deadline passes; there is
/// no ordering between tasks after dispatch.
pub struct ScheduledPool {
    shared: Arc<Shared>,
    scheduler: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ScheduledPool {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            cond: Condvar::new(),
        });

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                std::thread::spawn(move || loop {
                    let job = receiver.lock().unwrap().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();

        let scheduler = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || Self::scheduler_loop(&shared, sender))
        };

        Self {
            shared,
            scheduler: Some(scheduler),
            workers,
        }
    }

    /// Register a one-shot task `delay` from now.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();

        let seq = state.next_seq;
        state.next_seq += 1;

        if state.shutdown {
            warn!("task scheduled after pool shutdown, dropping");
            return TaskHandle(seq);
        }

        state.deadlines.push(Reverse((Instant::now() + delay, seq)));
        state.jobs.insert(seq, Box::new(job));
        drop(state);

        self.shared.cond.notify_all();

        TaskHandle(seq)
    }

    /// Remove a still-pending task. Returns false if it already ran, was
    /// cancelled before, or is currently executing.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        state.jobs.remove(&handle.0).is_some()
    }

    /// Stop accepting work, run out the pending queue, join all threads.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.cond.notify_all();

        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.join();
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn scheduler_loop(shared: &Shared, sender: mpsc::Sender<Job>) {
        let mut state = shared.state.lock().unwrap();

        loop {
            let now = Instant::now();

            while let Some(&Reverse((deadline, seq))) = state.deadlines.peek() {
                if deadline > now {
                    break;
                }
                state.deadlines.pop();
                // a missing job was cancelled after scheduling
                if let Some(job) = state.jobs.remove(&seq) {
                    if sender.send(job).is_err() {
                        return;
                    }
                }
            }

            if state.shutdown && state.jobs.is_empty() {
                break;
            }

            let next_deadline = state.deadlines.peek().map(|&Reverse((deadline, _))| deadline);
            state = match next_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    shared.cond.wait_timeout(state, timeout).unwrap().0
                }
                None => shared.cond.wait(state).unwrap(),
            };
        }
    }
}

impl Drop for ScheduledPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fixed-size FIFO worker pool; jobs run in submission order per worker
/// with no cross-worker ordering.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                std::thread::spawn(move || loop {
                    let job = receiver.lock().unwrap().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                warn!("worker pool is shut down, dropping job");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
