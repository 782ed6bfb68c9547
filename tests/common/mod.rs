#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vk_submit::{
    CommandConfig, CommandManager, DeviceCall, NullDevice, Task, TaskPool, WorkerPool,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> CommandConfig {
    CommandConfig {
        fence_timeout_ms: Some(10_000),
        retry_budget: 20_000,
        retry_backoff_us: 200,
        shutdown_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub device: Arc<NullDevice>,
    pub pool: Arc<TaskPool>,
    pub manager: Arc<CommandManager>,
}

pub fn harness() -> Harness {
    harness_with(test_config(), 3)
}

pub fn harness_with(config: CommandConfig, threads: usize) -> Harness {
    init_logging();
    let device = Arc::new(NullDevice::new());
    let pool = Arc::new(TaskPool::new(threads, "test-submit").unwrap());
    let manager = CommandManager::initialize(device.clone(), pool.clone(), config).unwrap();
    Harness {
        device,
        pool,
        manager: Arc::new(manager),
    }
}

/// Holds every dispatched task until the test forwards them, in an order of
/// its choosing, to a real pool.
#[derive(Default)]
pub struct DeferredPool {
    tasks: Mutex<Vec<Option<Task>>>,
}

impl DeferredPool {
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Forwards the task dispatched `index`-th.
    pub fn release(&self, index: usize, to: &dyn WorkerPool) {
        let task = self.tasks.lock()[index].take().expect("task already released");
        to.dispatch(task);
    }
}

impl WorkerPool for DeferredPool {
    fn dispatch(&self, task: Task) {
        self.tasks.lock().push(Some(task));
    }
}

/// Drops the first dispatched task, as if its pool lane stopped running.
pub struct StarvingPool {
    inner: TaskPool,
    dropped_first: Mutex<bool>,
}

impl StarvingPool {
    pub fn new(threads: usize) -> Self {
        Self {
            inner: TaskPool::new(threads, "starving").unwrap(),
            dropped_first: Mutex::new(false),
        }
    }
}

impl WorkerPool for StarvingPool {
    fn dispatch(&self, task: Task) {
        let mut dropped = self.dropped_first.lock();
        if !*dropped {
            *dropped = true;
            return;
        }
        drop(dropped);
        self.inner.dispatch(task);
    }
}

/// Waits until the device has seen `count` queue calls.
pub fn wait_for_queue_calls(device: &NullDevice, count: usize) -> Vec<DeviceCall> {
    for _ in 0..1_000 {
        let calls = device.queue_calls();
        if calls.len() >= count {
            return calls;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("expected {} queue calls, saw {:?}", count, device.queue_calls());
}
