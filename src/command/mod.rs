// Command manager - asynchronous record / submit / present
//
// Flow:
//   record_async  -> recording worker encodes into the next primary buffer
//   submit_async  -> ticket reserved now, queue submit issued by a pool task
//                    once every earlier ticket has completed
//   present_async -> same ticket order, under the swapchain usage lock
//   wait_for_fence -> host flag first (cheap, shared), then the GPU fence

mod handle;
mod orderer;
mod recorder;

pub use handle::{CommandBufferHandle, CommandBufferState};
pub use orderer::{SubmissionOrderer, Ticket, Turn};
pub use recorder::{EncodeFn, RecordOrder};

use anyhow::Context;
use ash::vk;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{Fence, GpuDevice, QueuePresent, QueueSubmit, Semaphore, Swapchain, INFINITE_TIMEOUT};
use crate::config::CommandConfig;
use crate::error::{CommandError, CommandResult};
use crate::pool::{TaskStatus, WorkerPool};
use handle::CommandBufferSlots;
use orderer::Progress;
use recorder::{RecordJob, RecordingWorker};

/// Number of primary command buffers the manager alternates between.
pub const PRIMARY_BUFFER_COUNT: u32 = 2;

/// Semaphores and fence for one submission. The caller keeps every
/// referenced object alive until the submission has completed.
#[derive(Debug, Clone)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<Semaphore>,
    /// Stage mask applied to every wait semaphore.
    pub wait_stage_mask: vk::PipelineStageFlags,
    pub signal_semaphores: Vec<Semaphore>,
    pub fence: Option<Fence>,
}

impl Default for SubmitInfo {
    fn default() -> Self {
        Self {
            wait_semaphores: Vec::new(),
            wait_stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
            signal_semaphores: Vec::new(),
            fence: None,
        }
    }
}

/// Swapchains to present with one image index each.
#[derive(Debug, Clone, Default)]
pub struct PresentInfo {
    pub wait_semaphores: Vec<Semaphore>,
    pub swapchains: Vec<Arc<Swapchain>>,
    pub image_indices: Vec<u32>,
}

/// State shared between the manager and its in-flight pool tasks.
struct Shared {
    device: Arc<dyn GpuDevice>,
    slots: Arc<CommandBufferSlots>,
    orderer: SubmissionOrderer,
    /// Guards every fence's host-side state.
    submission: Mutex<()>,
    submitted: Condvar,
    /// First fatal error. Once set, no new work is accepted.
    fatal: Mutex<Option<CommandError>>,
    /// `false` once the command pool is gone. Tasks hold the read side for
    /// every device call they make with a turn.
    device_open: RwLock<bool>,
    config: CommandConfig,
}

pub struct CommandManager {
    shared: Arc<Shared>,
    pool: Arc<dyn WorkerPool>,
    recorder: RecordingWorker,
    command_pool: vk::CommandPool,
    terminated: AtomicBool,
}

impl CommandManager {
    /// Creates the command pool and its primary buffers, then starts the
    /// recording worker.
    pub fn initialize(
        device: Arc<dyn GpuDevice>,
        pool: Arc<dyn WorkerPool>,
        config: CommandConfig,
    ) -> anyhow::Result<Self> {
        let command_pool = device
            .create_command_pool()
            .context("Failed to create command pool")?;

        let buffers = match device.allocate_command_buffers(command_pool, PRIMARY_BUFFER_COUNT) {
            Ok(buffers) => buffers,
            Err(e) => {
                device.destroy_command_pool(command_pool);
                return Err(e).context("Failed to allocate primary command buffers");
            }
        };

        let slots = Arc::new(CommandBufferSlots::new(buffers));
        let recorder = RecordingWorker::new(device.clone(), slots.clone(), config.record_order);
        if let Err(e) = recorder.start() {
            device.destroy_command_pool(command_pool);
            return Err(e.context("Failed to start recording worker"));
        }

        log::info!(
            "Command manager initialized: {} primary buffers, {:?} recording",
            slots.len(),
            config.record_order
        );

        Ok(Self {
            shared: Arc::new(Shared {
                device,
                slots,
                orderer: SubmissionOrderer::new(),
                submission: Mutex::new(()),
                submitted: Condvar::new(),
                fatal: Mutex::new(None),
                device_open: RwLock::new(true),
                config,
            }),
            pool,
            recorder,
            command_pool,
            terminated: AtomicBool::new(false),
        })
    }

    /// Queues `encode` for the recording worker against the next primary
    /// buffer. Returns without waiting for the recording.
    pub fn record_async<F>(&self, encode: F) -> CommandResult<CommandBufferHandle>
    where
        F: FnOnce(vk::CommandBuffer) -> anyhow::Result<()> + Send + 'static,
    {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(CommandError::WorkerStopped);
        }

        let (handle, buffer) = self.shared.slots.allocate();
        let job = RecordJob {
            handle,
            buffer,
            encode: Box::new(encode),
        };
        if let Err(e) = self.recorder.enqueue(job) {
            let _ = self.shared.slots.fail(handle, e.clone());
            return Err(e);
        }

        log::trace!("Queued recording into {:?} as {:?}", buffer, handle);
        Ok(handle)
    }

    /// Reserves a ticket and dispatches the submission of `handle`.
    pub fn submit_async(&self, info: SubmitInfo, handle: CommandBufferHandle) -> CommandResult<Ticket> {
        self.check_accepting()?;
        // Reject a recycled handle up front, before it takes a ticket
        self.shared.slots.buffer(handle)?;

        let ticket = self.shared.orderer.reserve();
        let mut task = SubmitTask {
            shared: self.shared.clone(),
            info,
            handle,
            ticket,
            attempts: TurnAttempts::default(),
        };
        self.pool.dispatch(Box::new(move || task.poll()));

        log::trace!("Submission {} dispatched for {:?}", ticket, handle);
        Ok(ticket)
    }

    /// Reserves a ticket and dispatches the present.
    pub fn present_async(&self, info: PresentInfo) -> CommandResult<Ticket> {
        self.check_accepting()?;
        if info.swapchains.len() != info.image_indices.len() {
            return Err(CommandError::MismatchedPresent {
                swapchains: info.swapchains.len(),
                image_indices: info.image_indices.len(),
            });
        }
        // Each usage lock is taken once per present
        for (index, swapchain) in info.swapchains.iter().enumerate() {
            if info.swapchains[..index].iter().any(|other| Arc::ptr_eq(other, swapchain)) {
                return Err(CommandError::DuplicateSwapchain);
            }
        }

        let ticket = self.shared.orderer.reserve();
        let mut task = PresentTask {
            shared: self.shared.clone(),
            info,
            ticket,
            attempts: TurnAttempts::default(),
        };
        self.pool.dispatch(Box::new(move || task.poll()));

        log::trace!("Present {} dispatched", ticket);
        Ok(ticket)
    }

    /// Blocks until the submission targeting `fence` has reached the queue,
    /// then until the GPU has signaled it.
    pub fn wait_for_fence(&self, fence: &Fence) -> CommandResult<()> {
        let deadline = self.shared.config.fence_timeout().map(|t| Instant::now() + t);

        {
            let mut guard = self.shared.submission.lock();
            loop {
                if let Some(error) = fence.state().error() {
                    return Err(error);
                }
                if fence.state().is_submitted() {
                    break;
                }
                match deadline {
                    Some(deadline) => {
                        let timed_out = self
                            .shared
                            .submitted
                            .wait_until(&mut guard, deadline)
                            .timed_out();
                        if timed_out && !fence.state().is_submitted() && fence.state().error().is_none() {
                            return Err(CommandError::FenceTimeout);
                        }
                    }
                    None => self.shared.submitted.wait(&mut guard),
                }
            }
        }

        let timeout_ns = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                u64::try_from(remaining.as_nanos()).unwrap_or(INFINITE_TIMEOUT - 1)
            }
            None => INFINITE_TIMEOUT,
        };
        self.shared
            .device
            .wait_for_fence(fence.handle(), timeout_ns)
            .map_err(|e| self.shared.observe(CommandError::from(e)))
    }

    /// Clears the submission flag and resets the GPU fence for reuse.
    pub fn reset_fence(&self, fence: &Fence) -> CommandResult<()> {
        let _guard = self.shared.submission.lock();
        fence.state().clear();
        self.shared
            .device
            .reset_fence(fence.handle())
            .map_err(|e| self.shared.observe(CommandError::from(e)))
    }

    /// Releases `handle`. Must not race a submission still using it.
    pub fn free(&self, handle: CommandBufferHandle) -> CommandResult<()> {
        self.shared.slots.free(handle)
    }

    pub fn state(&self, handle: CommandBufferHandle) -> CommandResult<CommandBufferState> {
        self.shared.slots.state(handle)
    }

    /// Error attached to a failed recording or submission.
    pub fn error(&self, handle: CommandBufferHandle) -> CommandResult<Option<CommandError>> {
        self.shared.slots.error(handle)
    }

    /// The underlying command buffer `handle` records into.
    pub fn command_buffer(&self, handle: CommandBufferHandle) -> CommandResult<vk::CommandBuffer> {
        self.shared.slots.buffer(handle)
    }

    /// First fatal error (device loss, starved ticket), if any.
    pub fn device_error(&self) -> Option<CommandError> {
        self.shared.fatal.lock().clone()
    }

    /// Reserved submit/present tickets that have not completed yet.
    pub fn pending(&self) -> u64 {
        self.shared.orderer.pending()
    }

    pub fn record_order(&self) -> RecordOrder {
        self.recorder.order()
    }

    /// Waits for outstanding work, stops the recording worker and destroys
    /// the command pool. Safe to call more than once.
    pub fn terminate(&self) -> CommandResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Terminating command manager...");

        let timeout = self.shared.config.shutdown_timeout();
        if !self.shared.orderer.wait_idle(timeout) {
            log::warn!(
                "{} submissions still pending after {:?}, abandoning them",
                self.shared.orderer.pending(),
                timeout
            );
            let mut fatal = self.shared.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(CommandError::WorkerStopped);
            }
        }

        // Waits for any task in the middle of a device call, then keeps
        // later turns off the device
        *self.shared.device_open.write() = false;

        let idle = self.shared.device.wait_idle().map_err(CommandError::from);
        if let Err(e) = &idle {
            log::error!("Device wait idle failed: {}", e);
        }

        // The worker must be gone before its command buffers are
        self.recorder.stop();
        self.shared.device.destroy_command_pool(self.command_pool);

        log::info!("Command manager terminated");
        idle
    }
}

impl Drop for CommandManager {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log::error!("Command manager teardown failed: {}", e);
        }
    }
}

impl CommandManager {
    fn check_accepting(&self) -> CommandResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(CommandError::WorkerStopped);
        }
        self.shared.check_fatal()
    }
}

/// Turn attempts since the queue last showed progress.
#[derive(Debug, Default)]
struct TurnAttempts {
    count: u32,
    seen: Option<Progress>,
}

impl Shared {
    fn check_fatal(&self) -> CommandResult<()> {
        match self.fatal.lock().as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Remembers fatal errors; returns the error for chaining.
    fn observe(&self, error: CommandError) -> CommandError {
        if error.is_fatal() {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                log::error!("Fatal command error: {}", error);
                *fatal = Some(error.clone());
            }
        }
        error
    }

    /// Publishes the outcome of a submission to its handle and fence and
    /// wakes every fence waiter.
    fn finish_submission(&self, handle: CommandBufferHandle, fence: Option<&Fence>, result: CommandResult<()>) {
        if let Err(error) = &result {
            self.observe(error.clone());
            if self.slots.fail(handle, error.clone()).is_err() {
                log::warn!("Submission failed for recycled handle {:?}: {}", handle, error);
            }
        }

        if let Some(fence) = fence {
            let guard = self.submission.lock();
            match result {
                Ok(()) => fence.state().mark_submitted(),
                Err(error) => fence.state().fail(error),
            }
            drop(guard);
            self.submitted.notify_all();
        }
    }

    /// Turn bookkeeping shared by submit and present tasks: `Ok(Some)` when
    /// the turn is ours, `Ok(None)` to retry later, `Err` once the retry
    /// budget is spent without the head ticket advancing or polling.
    fn take_turn(&self, ticket: Ticket, attempts: &mut TurnAttempts) -> CommandResult<Option<Turn<'_>>> {
        if let Some(turn) = self.orderer.wait_turn(ticket, self.config.retry_backoff()) {
            return Ok(Some(turn));
        }

        let progress = self.orderer.progress();
        if attempts.seen != Some(progress) {
            attempts.seen = Some(progress);
            attempts.count = 0;
        }
        attempts.count += 1;
        if attempts.count >= self.config.retry_budget {
            let blocked_on = self.orderer.next_to_complete();
            log::error!(
                "Ticket {} starved after {} attempts, queue still waiting on {}",
                ticket,
                attempts.count,
                blocked_on
            );
            return Err(CommandError::StarvedTicket {
                ticket: ticket.index(),
                blocked_on: blocked_on.index(),
            });
        }
        Ok(None)
    }
}

struct SubmitTask {
    shared: Arc<Shared>,
    info: SubmitInfo,
    handle: CommandBufferHandle,
    ticket: Ticket,
    attempts: TurnAttempts,
}

impl SubmitTask {
    fn poll(&mut self) -> TaskStatus {
        let shared = self.shared.clone();

        // Recording runs on its own thread; wait for it without holding a turn
        let recorded = match shared.slots.wait_recorded(self.handle, shared.config.retry_backoff()) {
            Some(recorded) => recorded,
            None => {
                shared.orderer.touch(self.ticket);
                return TaskStatus::NotReady;
            }
        };

        let turn = match shared.take_turn(self.ticket, &mut self.attempts) {
            Ok(Some(turn)) => turn,
            Ok(None) => return TaskStatus::NotReady,
            Err(starved) => {
                shared.finish_submission(self.handle, self.info.fence.as_ref(), Err(starved));
                return TaskStatus::Complete;
            }
        };

        log::trace!("Ticket {} has the queue", turn.ticket());
        let result = recorded.and_then(|()| {
            let open = shared.device_open.read();
            if !*open {
                return Err(CommandError::WorkerStopped);
            }
            self.submit()
        });
        if let Err(e) = &result {
            log::error!("Submission {} failed: {}", self.ticket, e);
        }
        shared.finish_submission(self.handle, self.info.fence.as_ref(), result);
        drop(turn);

        TaskStatus::Complete
    }

    fn submit(&self) -> CommandResult<()> {
        let device = &self.shared.device;
        let buffer = self.shared.slots.buffer(self.handle)?;
        device.end_command_buffer(buffer)?;

        let wait_semaphores: Vec<vk::Semaphore> =
            self.info.wait_semaphores.iter().map(Semaphore::handle).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            self.info.signal_semaphores.iter().map(Semaphore::handle).collect();
        let fence = self.info.fence.as_ref().map_or(vk::Fence::null(), Fence::handle);

        device.queue_submit(&QueueSubmit {
            command_buffer: buffer,
            wait_semaphores: &wait_semaphores,
            wait_stage_mask: self.info.wait_stage_mask,
            signal_semaphores: &signal_semaphores,
            fence,
        })?;

        if self
            .shared
            .slots
            .transition(self.handle, CommandBufferState::Submitted)
            .is_err()
        {
            log::warn!("Handle {:?} was recycled while its submission was in flight", self.handle);
        }
        log::trace!("Submitted {:?} ({})", buffer, self.ticket);
        Ok(())
    }
}

struct PresentTask {
    shared: Arc<Shared>,
    info: PresentInfo,
    ticket: Ticket,
    attempts: TurnAttempts,
}

impl PresentTask {
    fn poll(&mut self) -> TaskStatus {
        let shared = self.shared.clone();

        let turn = match shared.take_turn(self.ticket, &mut self.attempts) {
            Ok(Some(turn)) => turn,
            Ok(None) => return TaskStatus::NotReady,
            Err(starved) => {
                shared.observe(starved);
                return TaskStatus::Complete;
            }
        };

        let open = shared.device_open.read();
        if !*open {
            log::warn!("Present {} dropped: command manager terminated", turn.ticket());
        } else if let Err(e) = self.present() {
            log::error!("Present {} failed: {}", self.ticket, e);
            shared.observe(e);
        }
        drop(open);
        drop(turn);

        TaskStatus::Complete
    }

    fn present(&self) -> CommandResult<()> {
        // Held until the present call returns
        let guards: Vec<_> = self.info.swapchains.iter().map(|s| s.lock_usage()).collect();
        let swapchains: Vec<vk::SwapchainKHR> = guards.iter().map(|guard| **guard).collect();
        let wait_semaphores: Vec<vk::Semaphore> =
            self.info.wait_semaphores.iter().map(Semaphore::handle).collect();

        let result = self.shared.device.queue_present(&QueuePresent {
            wait_semaphores: &wait_semaphores,
            swapchains: &swapchains,
            image_indices: &self.info.image_indices,
        });

        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::debug!("Swapchain suboptimal after present {}", self.ticket);
                self.mark_out_of_date();
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date at present {}", self.ticket);
                self.mark_out_of_date();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_out_of_date(&self) {
        for swapchain in &self.info.swapchains {
            swapchain.mark_out_of_date();
        }
    }
}
