// Backend module - GPU device abstraction
//
// Design: the command core only needs a narrow slice of the device (command
// buffers, queue submit/present, fences and semaphores). That slice is the
// `GpuDevice` trait, implemented by the real ash device and by an in-memory
// device that logs every call for tests and GPU-less runs.

pub mod device;
pub mod null;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use null::{DeviceCall, NullDevice};
pub use swapchain::Swapchain;
pub use sync::{Fence, FenceInit, Semaphore};

use ash::prelude::VkResult;
use ash::vk;

/// Timeout value meaning "wait forever".
pub const INFINITE_TIMEOUT: u64 = u64::MAX;

/// One queue submission: a single primary command buffer plus its
/// semaphores and optional fence (`vk::Fence::null()` when absent).
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmit<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Applied to every wait semaphore.
    pub wait_stage_mask: vk::PipelineStageFlags,
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

#[derive(Debug, Clone, Copy)]
pub struct QueuePresent<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub swapchains: &'a [vk::SwapchainKHR],
    pub image_indices: &'a [u32],
}

/// The device/queue operations the command core consumes.
///
/// Queue operations (`queue_submit`, `queue_present`) are only ever issued by
/// the task holding the current submission turn, but implementations must
/// still be `Sync`: recording, fence waits and submissions run on different
/// threads.
pub trait GpuDevice: Send + Sync {
    /// Creates a command pool on the graphics queue family whose buffers can
    /// be reset individually.
    fn create_command_pool(&self) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> VkResult<()>;
    /// Returns `true` when the swapchain is suboptimal.
    fn queue_present(&self, present: &QueuePresent<'_>) -> VkResult<bool>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `timeout_ns == INFINITE_TIMEOUT` waits forever. A timeout is reported
    /// as `Err(vk::Result::TIMEOUT)`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn wait_idle(&self) -> VkResult<()>;
}
