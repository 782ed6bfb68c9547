// Command buffer handles
//
// The manager owns a fixed set of primary command buffers and hands them out
// in rotation. Handles are slot index + generation: allocating a slot again
// bumps its generation, so an old handle can never reach a recycled buffer.

use ash::vk;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CommandError, CommandResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    slot: u32,
    generation: u32,
}

impl CommandBufferHandle {
    /// Index of the underlying command buffer in the rotation.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Lifecycle of one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Allocated,
    Recording,
    RecordComplete,
    Submitted,
    Failed,
    Retired,
}

struct Slot {
    generation: u32,
    state: CommandBufferState,
    error: Option<CommandError>,
}

struct SlotTable {
    next: usize,
    slots: Vec<Slot>,
}

pub(crate) struct CommandBufferSlots {
    buffers: Vec<vk::CommandBuffer>,
    table: Mutex<SlotTable>,
    changed: Condvar,
}

impl CommandBufferSlots {
    pub(crate) fn new(buffers: Vec<vk::CommandBuffer>) -> Self {
        let slots = buffers
            .iter()
            .map(|_| Slot {
                generation: 0,
                state: CommandBufferState::Retired,
                error: None,
            })
            .collect();
        Self {
            buffers,
            table: Mutex::new(SlotTable { next: 0, slots }),
            changed: Condvar::new(),
        }
    }

    /// Binds a new handle to the next buffer in the rotation.
    pub(crate) fn allocate(&self) -> (CommandBufferHandle, vk::CommandBuffer) {
        let mut table = self.table.lock();
        let index = table.next;
        table.next = (index + 1) % self.buffers.len();

        let slot = &mut table.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = CommandBufferState::Allocated;
        slot.error = None;
        let handle = CommandBufferHandle {
            slot: index as u32,
            generation: slot.generation,
        };
        drop(table);
        // Anyone parked on the previous generation must see it is gone
        self.changed.notify_all();

        (handle, self.buffers[index])
    }

    pub(crate) fn buffer(&self, handle: CommandBufferHandle) -> CommandResult<vk::CommandBuffer> {
        let table = self.table.lock();
        Self::live(&table, handle)?;
        Ok(self.buffers[handle.slot()])
    }

    pub(crate) fn state(&self, handle: CommandBufferHandle) -> CommandResult<CommandBufferState> {
        let table = self.table.lock();
        Ok(Self::live(&table, handle)?.state)
    }

    pub(crate) fn error(&self, handle: CommandBufferHandle) -> CommandResult<Option<CommandError>> {
        let table = self.table.lock();
        Ok(Self::live(&table, handle)?.error.clone())
    }

    pub(crate) fn transition(
        &self,
        handle: CommandBufferHandle,
        state: CommandBufferState,
    ) -> CommandResult<()> {
        let mut table = self.table.lock();
        Self::live_mut(&mut table, handle)?.state = state;
        drop(table);
        self.changed.notify_all();
        Ok(())
    }

    pub(crate) fn fail(&self, handle: CommandBufferHandle, error: CommandError) -> CommandResult<()> {
        let mut table = self.table.lock();
        let slot = Self::live_mut(&mut table, handle)?;
        slot.state = CommandBufferState::Failed;
        slot.error = Some(error);
        drop(table);
        self.changed.notify_all();
        Ok(())
    }

    /// Releases the handle. Freeing a handle twice is a no-op.
    pub(crate) fn free(&self, handle: CommandBufferHandle) -> CommandResult<()> {
        let mut table = self.table.lock();
        let slot = &mut table.slots[handle.slot()];
        if slot.generation != handle.generation {
            return Err(CommandError::StaleHandle);
        }
        slot.state = CommandBufferState::Retired;
        drop(table);
        self.changed.notify_all();
        Ok(())
    }

    /// Parks for up to `timeout` until the recording has finished. Returns
    /// `None` while it is still in progress, `Some(Ok(()))` once the buffer
    /// holds a complete recording and `Some(Err(..))` if it can never be
    /// submitted.
    pub(crate) fn wait_recorded(
        &self,
        handle: CommandBufferHandle,
        timeout: Duration,
    ) -> Option<CommandResult<()>> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        loop {
            let slot = match Self::live(&table, handle) {
                Ok(slot) => slot,
                Err(error) => return Some(Err(error)),
            };
            match slot.state {
                CommandBufferState::Allocated | CommandBufferState::Recording => {}
                CommandBufferState::RecordComplete => return Some(Ok(())),
                CommandBufferState::Failed => {
                    let error = slot
                        .error
                        .clone()
                        .unwrap_or(CommandError::InvalidState(CommandBufferState::Failed));
                    return Some(Err(error));
                }
                state => return Some(Err(CommandError::InvalidState(state))),
            }
            if self.changed.wait_until(&mut table, deadline).timed_out() {
                return None;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    fn live(table: &SlotTable, handle: CommandBufferHandle) -> CommandResult<&Slot> {
        match table.slots.get(handle.slot()) {
            Some(slot)
                if slot.generation == handle.generation
                    && slot.state != CommandBufferState::Retired =>
            {
                Ok(slot)
            }
            _ => Err(CommandError::StaleHandle),
        }
    }

    fn live_mut(table: &mut SlotTable, handle: CommandBufferHandle) -> CommandResult<&mut Slot> {
        match table.slots.get_mut(handle.slot()) {
            Some(slot)
                if slot.generation == handle.generation
                    && slot.state != CommandBufferState::Retired =>
            {
                Ok(slot)
            }
            _ => Err(CommandError::StaleHandle),
        }
    }
}
