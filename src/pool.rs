// Worker pool - runs submission and present tasks
//
// A task reports `Complete` or `NotReady`. Not-ready tasks go to the back of
// the shared channel, so every not-ready task is polled again after all work
// queued before it. That FIFO re-queue is the fairness the submission order
// depends on: a ticket can never be left unpolled forever.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::config::PoolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Complete,
    /// Run the task again later.
    NotReady,
}

pub type Task = Box<dyn FnMut() -> TaskStatus + Send + 'static>;

/// Dispatch contract consumed by the command manager.
///
/// Implementations must eventually re-invoke every task that returned
/// `NotReady`.
pub trait WorkerPool: Send + Sync {
    fn dispatch(&self, task: Task);
}

enum Work {
    Run(Task),
    Terminate,
}

pub struct TaskPool {
    sender: Sender<Work>,
    receiver: Receiver<Work>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TaskPool {
    pub fn new(threads: usize, name: &str) -> Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Work>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let requeue = sender.clone();
            let worker = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || Self::run_worker(receiver, requeue))
                .with_context(|| format!("Failed to spawn worker thread {}-{}", name, index))?;
            workers.push(worker);
        }
        log::debug!("Started {} pool workers ({})", threads, name);

        Ok(Self {
            sender,
            receiver,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(config.worker_threads, &config.thread_name)
    }

    fn run_worker(receiver: Receiver<Work>, requeue: Sender<Work>) {
        while let Ok(work) = receiver.recv() {
            match work {
                Work::Run(mut task) => {
                    if task() == TaskStatus::NotReady && requeue.send(Work::Run(task)).is_err() {
                        log::warn!("Pool channel closed, dropping not-ready task");
                    }
                }
                Work::Terminate => break,
            }
        }
    }

    /// Stops and joins all workers. Tasks still queued are dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock();
        for _ in 0..workers.len() {
            let _ = self.sender.send(Work::Terminate);
        }
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Pool worker panicked");
            }
        }

        let dropped = self
            .receiver
            .try_iter()
            .filter(|work| matches!(work, Work::Run(_)))
            .count();
        if dropped > 0 {
            log::warn!("Pool shut down with {} queued tasks", dropped);
        }
    }
}

impl WorkerPool for TaskPool {
    fn dispatch(&self, task: Task) {
        if self.shut_down.load(Ordering::SeqCst) {
            log::warn!("Task dispatched after pool shutdown, dropping it");
            return;
        }
        // Both ends live in `self`, so the channel cannot be disconnected here
        let _ = self.sender.send(Work::Run(task));
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
