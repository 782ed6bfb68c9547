// =============================================================================
// VK-SUBMIT - Asynchronous command recording and ordered submission
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Application threads (record_async / submit_async / present)    │
// │    └── CommandManager                                           │
// │          ├── RecordingWorker (one thread, encodes buffers)      │
// │          ├── SubmissionOrderer (tickets -> queue order)         │
// │          └── WorkerPool (submit / present tasks, any order)     │
// │                └── GpuDevice (ash device, or NullDevice)        │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

//! Order-preserving asynchronous command submission for Vulkan.
//!
//! Application threads hand encode closures to [`CommandManager::record_async`]
//! and queue the resulting buffers with [`CommandManager::submit_async`] and
//! [`CommandManager::present_async`]. None of these block. Submissions and
//! presents run on a [`WorkerPool`] in any order, yet reach the GPU queue in
//! the order they were requested. Completion comes back through
//! [`CommandManager::wait_for_fence`].

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod pool;

pub use backend::{DeviceCall, Fence, FenceInit, GpuDevice, NullDevice, Semaphore, Swapchain, VulkanDevice};
pub use command::{
    CommandBufferHandle, CommandBufferState, CommandManager, PresentInfo, RecordOrder, SubmitInfo,
    Ticket,
};
pub use config::{CommandConfig, Config, DebugConfig, PoolConfig};
pub use error::{CommandError, CommandResult};
pub use pool::{Task, TaskPool, TaskStatus, WorkerPool};

/// Initialize logging at the configured level. `RUST_LOG` is honored for
/// per-module filters; calling this twice is harmless.
pub fn init_logging(config: &DebugConfig) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(config.level_filter());
    builder.parse_default_env();
    let _ = builder.try_init();
}
