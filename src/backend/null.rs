// Null device - in-memory GPU
//
// Mints unique handles, logs every recording and queue call in the order it
// happened, and "executes" submissions instantly by signaling their fence.
// Used by the test suite and by the demo when no Vulkan driver is present.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{GpuDevice, QueuePresent, QueueSubmit, INFINITE_TIMEOUT};

/// One observable device call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        command_buffer: vk::CommandBuffer,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present {
        swapchains: Vec<vk::SwapchainKHR>,
        image_indices: Vec<u32>,
    },
    WaitIdle,
}

impl DeviceCall {
    /// Submit and present calls, the ones the submission order applies to.
    pub fn is_queue_call(&self) -> bool {
        matches!(self, DeviceCall::Submit { .. } | DeviceCall::Present { .. })
    }
}

#[derive(Default)]
struct Faults {
    submit: Option<vk::Result>,
    present: Option<vk::Result>,
    begin: Option<vk::Result>,
}

#[derive(Default)]
pub struct NullDevice {
    next_handle: AtomicU64,
    calls: Mutex<Vec<DeviceCall>>,
    /// Known fences and whether they are signaled.
    fences: Mutex<HashMap<vk::Fence, bool>>,
    fence_signaled: Condvar,
    hold_fences: AtomicBool,
    faults: Mutex<Faults>,
    submit_latency: Mutex<Duration>,
    queue_users: AtomicUsize,
    max_queue_users: AtomicUsize,
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Snapshot of every call so far, in call order.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn queue_calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().iter().filter(|call| call.is_queue_call()).cloned().collect()
    }

    /// Highest number of threads seen inside a queue call at once.
    pub fn max_concurrent_queue_calls(&self) -> usize {
        self.max_queue_users.load(Ordering::SeqCst)
    }

    /// When set, submitted fences stay unsignaled until `signal_fence`.
    pub fn set_hold_fences(&self, hold: bool) {
        self.hold_fences.store(hold, Ordering::SeqCst);
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        self.fences.lock().insert(fence, true);
        self.fence_signaled.notify_all();
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.fences.lock().get(&fence).copied().unwrap_or(false)
    }

    pub fn set_submit_latency(&self, latency: Duration) {
        *self.submit_latency.lock() = latency;
    }

    pub fn fail_next_submit(&self, result: vk::Result) {
        self.faults.lock().submit = Some(result);
    }

    pub fn fail_next_present(&self, result: vk::Result) {
        self.faults.lock().present = Some(result);
    }

    pub fn fail_next_begin(&self, result: vk::Result) {
        self.faults.lock().begin = Some(result);
    }

    fn mint<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn log(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    fn enter_queue(&self) {
        let users = self.queue_users.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_queue_users.fetch_max(users, Ordering::SeqCst);
    }

    fn leave_queue(&self) {
        self.queue_users.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GpuDevice for NullDevice {
    fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        Ok(self.mint())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| self.mint()).collect())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.log(DeviceCall::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        if let Some(result) = self.faults.lock().begin.take() {
            return Err(result);
        }
        self.log(DeviceCall::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.log(DeviceCall::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> VkResult<()> {
        self.enter_queue();
        let latency = *self.submit_latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let fault = self.faults.lock().submit.take();
        let result = match fault {
            Some(result) => Err(result),
            None => {
                self.log(DeviceCall::Submit {
                    command_buffer: submit.command_buffer,
                    wait_semaphores: submit.wait_semaphores.to_vec(),
                    signal_semaphores: submit.signal_semaphores.to_vec(),
                    fence: submit.fence,
                });
                if submit.fence != vk::Fence::null() && !self.hold_fences.load(Ordering::SeqCst) {
                    self.signal_fence(submit.fence);
                }
                Ok(())
            }
        };
        self.leave_queue();
        result
    }

    fn queue_present(&self, present: &QueuePresent<'_>) -> VkResult<bool> {
        self.enter_queue();
        let fault = self.faults.lock().present.take();
        let result = match fault {
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(result) => Err(result),
            None => Ok(false),
        };
        if result.is_ok() {
            self.log(DeviceCall::Present {
                swapchains: present.swapchains.to_vec(),
                image_indices: present.image_indices.to_vec(),
            });
        }
        self.leave_queue();
        result
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(self.mint())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence = self.mint();
        self.fences.lock().insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.lock().remove(&fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        // Signals for other fences wake us too; they must not extend the wait
        let deadline = if timeout_ns == INFINITE_TIMEOUT {
            None
        } else {
            Instant::now().checked_add(Duration::from_nanos(timeout_ns))
        };

        let mut fences = self.fences.lock();
        loop {
            match fences.get(&fence) {
                None => return Err(vk::Result::ERROR_UNKNOWN),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            let timed_out = match deadline {
                Some(deadline) => self.fence_signaled.wait_until(&mut fences, deadline).timed_out(),
                None => {
                    self.fence_signaled.wait(&mut fences);
                    false
                }
            };
            if timed_out {
                return match fences.get(&fence) {
                    Some(true) => Ok(()),
                    _ => Err(vk::Result::TIMEOUT),
                };
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        match self.fences.lock().get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.log(DeviceCall::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn submit(device: &NullDevice, fence: vk::Fence) -> VkResult<()> {
        device.queue_submit(&QueueSubmit {
            command_buffer: vk::CommandBuffer::from_raw(99),
            wait_semaphores: &[],
            wait_stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
            signal_semaphores: &[],
            fence,
        })
    }

    #[test]
    fn submit_signals_fence() {
        let device = NullDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert_eq!(device.wait_for_fence(fence, 0), Err(vk::Result::TIMEOUT));

        submit(&device, fence).unwrap();
        assert!(device.is_fence_signaled(fence));
        device.wait_for_fence(fence, INFINITE_TIMEOUT).unwrap();

        device.reset_fence(fence).unwrap();
        assert!(!device.is_fence_signaled(fence));
    }

    #[test]
    fn held_fences_wait_for_explicit_signal() {
        let device = NullDevice::new();
        device.set_hold_fences(true);
        let fence = device.create_fence(false).unwrap();
        submit(&device, fence).unwrap();
        assert_eq!(device.wait_for_fence(fence, 1_000_000), Err(vk::Result::TIMEOUT));

        device.signal_fence(fence);
        device.wait_for_fence(fence, 1_000_000).unwrap();
    }

    #[test]
    fn other_fences_do_not_extend_a_bounded_wait() {
        let device = Arc::new(NullDevice::new());
        device.set_hold_fences(true);
        let held = device.create_fence(false).unwrap();
        let other = device.create_fence(false).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let signaler = {
            let device = device.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    device.signal_fence(other);
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
        };

        let start = Instant::now();
        let result = device.wait_for_fence(held, 50_000_000);
        let elapsed = start.elapsed();
        stop.store(true, Ordering::SeqCst);
        signaler.join().unwrap();

        assert_eq!(result, Err(vk::Result::TIMEOUT));
        assert!(elapsed < Duration::from_millis(500), "waited {:?}", elapsed);
    }

    #[test]
    fn injected_faults_fire_once() {
        let device = NullDevice::new();
        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(submit(&device, vk::Fence::null()), Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(device.queue_calls().is_empty());

        submit(&device, vk::Fence::null()).unwrap();
        assert_eq!(device.queue_calls().len(), 1);
    }

    #[test]
    fn handles_are_unique() {
        let device = NullDevice::new();
        let pool = device.create_command_pool().unwrap();
        let buffers = device.allocate_command_buffers(pool, 2).unwrap();
        assert_ne!(buffers[0], buffers[1]);
        assert_ne!(device.create_semaphore().unwrap(), device.create_semaphore().unwrap());
    }
}
