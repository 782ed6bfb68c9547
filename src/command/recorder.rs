// Recording worker - encodes command buffers off the calling thread
//
// One dedicated thread performs every recording, so a command buffer is
// never encoded from two threads at once, while the previous buffer is being
// submitted and executed.

use ash::vk;
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::handle::{CommandBufferHandle, CommandBufferSlots, CommandBufferState};
use crate::backend::GpuDevice;
use crate::error::{CommandError, CommandResult};

/// Caller-supplied encoder. Runs on the recording thread between begin and
/// end of the command buffer.
pub type EncodeFn = Box<dyn FnOnce(vk::CommandBuffer) -> anyhow::Result<()> + Send + 'static>;

/// Order in which queued recordings are picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrder {
    /// Oldest request first.
    #[default]
    Fifo,
    /// Newest request first.
    Lifo,
}

pub(crate) struct RecordJob {
    pub handle: CommandBufferHandle,
    pub buffer: vk::CommandBuffer,
    pub encode: EncodeFn,
}

enum RecordMessage {
    Record(RecordJob),
    Stop,
}

struct RecordQueue {
    messages: VecDeque<RecordMessage>,
    accepting: bool,
}

struct Shared {
    queue: Mutex<RecordQueue>,
    available: Condvar,
    order: RecordOrder,
    device: Arc<dyn GpuDevice>,
    slots: Arc<CommandBufferSlots>,
}

pub(crate) struct RecordingWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingWorker {
    /// Creates the worker without starting its thread. Jobs enqueued before
    /// `start` are kept and recorded once it runs.
    pub(crate) fn new(
        device: Arc<dyn GpuDevice>,
        slots: Arc<CommandBufferSlots>,
        order: RecordOrder,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(RecordQueue {
                    messages: VecDeque::new(),
                    accepting: true,
                }),
                available: Condvar::new(),
                order,
                device,
                slots,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        if !self.shared.queue.lock().accepting {
            anyhow::bail!("Recording worker was already stopped");
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("command-recorder".to_string())
            .spawn(move || shared.run())?;
        *thread = Some(handle);
        log::debug!("Recording worker started ({:?} order)", self.shared.order);
        Ok(())
    }

    pub fn order(&self) -> RecordOrder {
        self.shared.order
    }

    pub(crate) fn enqueue(&self, job: RecordJob) -> CommandResult<()> {
        let mut queue = self.shared.queue.lock();
        if !queue.accepting {
            return Err(CommandError::WorkerStopped);
        }
        queue.messages.push_back(RecordMessage::Record(job));
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Wakes the worker with a stop message and joins it. Recordings still
    /// queued fail with `WorkerStopped`.
    pub fn stop(&self) {
        let mut queue = self.shared.queue.lock();
        if !queue.accepting {
            return;
        }
        queue.accepting = false;
        queue.messages.push_back(RecordMessage::Stop);
        drop(queue);
        self.shared.available.notify_one();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("Recording worker panicked");
            }
        }
        // Never started: nobody else will drain the queue
        self.shared.drain();
        log::debug!("Recording worker stopped");
    }
}

impl Drop for RecordingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        loop {
            let message = {
                let mut queue = self.queue.lock();
                self.available.wait_while(&mut queue, |queue| queue.messages.is_empty());
                self.pop(&mut queue)
            };

            match message {
                Some(RecordMessage::Record(job)) => self.record(job),
                Some(RecordMessage::Stop) => break,
                None => {}
            }
        }
        self.drain();
    }

    fn pop(&self, queue: &mut RecordQueue) -> Option<RecordMessage> {
        match self.order {
            RecordOrder::Fifo => queue.messages.pop_front(),
            RecordOrder::Lifo => queue.messages.pop_back(),
        }
    }

    fn drain(&self) {
        let messages: Vec<RecordMessage> = self.queue.lock().messages.drain(..).collect();
        for message in messages {
            if let RecordMessage::Record(job) = message {
                let _ = self.slots.fail(job.handle, CommandError::WorkerStopped);
            }
        }
    }

    fn record(&self, job: RecordJob) {
        let RecordJob {
            handle,
            buffer,
            encode,
        } = job;

        if self.slots.transition(handle, CommandBufferState::Recording).is_err() {
            log::warn!("Skipping recording for {:?}: handle was recycled before recording", handle);
            return;
        }

        let outcome = match self.encode(buffer, encode) {
            Ok(()) => self.slots.transition(handle, CommandBufferState::RecordComplete),
            Err(error) => {
                log::error!("Recording into {:?} failed: {}", buffer, error);
                self.slots.fail(handle, error)
            }
        };
        if outcome.is_err() {
            log::warn!("Handle {:?} was recycled during recording", handle);
        }
    }

    fn encode(&self, buffer: vk::CommandBuffer, encode: EncodeFn) -> CommandResult<()> {
        self.device
            .reset_command_buffer(buffer)
            .map_err(|e| recording_error("reset", e))?;
        self.device
            .begin_command_buffer(buffer)
            .map_err(|e| recording_error("begin", e))?;

        match panic::catch_unwind(AssertUnwindSafe(|| encode(buffer))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(CommandError::recording(format!("{:#}", error))),
            Err(payload) => Err(CommandError::recording(format!(
                "encoder panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

fn recording_error(step: &str, result: vk::Result) -> CommandError {
    match CommandError::from(result) {
        CommandError::DeviceLost => CommandError::DeviceLost,
        _ => CommandError::recording(format!("{} command buffer: {}", step, result)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
