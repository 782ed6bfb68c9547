// Synchronization primitives
//
// Semaphores order GPU work across submissions; fences report GPU completion
// back to the host. Both have an explicit new/destroy lifecycle, owned by
// whoever created them (frame loop, swapchain owner, caller).

use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::GpuDevice;
use crate::error::{CommandError, CommandResult};

/// GPU-to-GPU ordering primitive. Not observable from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Semaphore {
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: &dyn GpuDevice) -> CommandResult<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self { handle })
    }

    pub fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self.handle);
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

/// Initial state of a new fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceInit {
    #[default]
    Unsignaled,
    /// Starts signaled and already marked as submitted, so a frame loop can
    /// wait on it before its first submission.
    Signaled,
}

/// GPU-to-host completion primitive plus the host-side submission flag.
///
/// Clones share the same state; the submission task keeps one clone while
/// the caller waits on another.
#[derive(Debug, Clone)]
pub struct Fence {
    handle: vk::Fence,
    state: Arc<FenceState>,
}

/// Host-side state of a fence. Only mutated while holding the command
/// manager's submission mutex, so waiters on its condition variable never
/// miss an update.
#[derive(Debug, Default)]
pub(crate) struct FenceState {
    submitted: AtomicBool,
    error: Mutex<Option<CommandError>>,
}

impl Fence {
    pub fn new(device: &dyn GpuDevice, init: FenceInit) -> CommandResult<Self> {
        let signaled = init == FenceInit::Signaled;
        let handle = device.create_fence(signaled)?;
        let state = FenceState {
            submitted: AtomicBool::new(signaled),
            error: Mutex::new(None),
        };
        Ok(Self {
            handle,
            state: Arc::new(state),
        })
    }

    pub fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_fence(self.handle);
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Whether the submission targeting this fence has reached the queue.
    pub fn submission_flag(&self) -> bool {
        self.state.is_submitted()
    }

    /// Error attached by a failed submission, if any.
    pub fn error(&self) -> Option<CommandError> {
        self.state.error()
    }

    pub(crate) fn state(&self) -> &FenceState {
        &self.state
    }
}

impl FenceState {
    pub(crate) fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn error(&self) -> Option<CommandError> {
        self.error.lock().clone()
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }

    pub(crate) fn fail(&self, error: CommandError) {
        *self.error.lock() = Some(error);
    }

    pub(crate) fn clear(&self) {
        self.submitted.store(false, Ordering::Release);
        *self.error.lock() = None;
    }
}
