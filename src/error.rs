// Error taxonomy for the command core
//
// Library operations return `CommandResult`. Setup paths (config, device
// creation) use anyhow instead.

use ash::vk;

use crate::command::CommandBufferState;

pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Errors surfaced by recording, submission and fence waits.
///
/// `Clone` because one failure is attached to several observers: the
/// command buffer handle, the fence of the submission and, for fatal
/// errors, the manager itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("device lost")]
    DeviceLost,
    #[error("recording failed: {message}")]
    RecordingFailure { message: String },
    #[error("ticket {ticket} starved waiting for ticket {blocked_on} to complete")]
    StarvedTicket { ticket: u64, blocked_on: u64 },
    #[error("fence wait timed out")]
    FenceTimeout,
    #[error("command buffer handle is stale")]
    StaleHandle,
    #[error("command buffer is in state {0:?}")]
    InvalidState(CommandBufferState),
    #[error("present names {swapchains} swapchains but {image_indices} image indices")]
    MismatchedPresent {
        swapchains: usize,
        image_indices: usize,
    },
    #[error("present names the same swapchain more than once")]
    DuplicateSwapchain,
    #[error("recording worker is not running")]
    WorkerStopped,
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl CommandError {
    /// Errors after which no further submission can be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::DeviceLost | CommandError::StarvedTicket { .. })
    }

    pub(crate) fn recording(message: impl Into<String>) -> Self {
        CommandError::RecordingFailure {
            message: message.into(),
        }
    }
}

impl From<vk::Result> for CommandError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => CommandError::DeviceLost,
            vk::Result::TIMEOUT => CommandError::FenceTimeout,
            other => CommandError::Vulkan(other),
        }
    }
}
