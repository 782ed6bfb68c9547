// Swapchain - presentation target
//
// Swapchain creation and image acquisition belong to the window layer. The
// command core only needs the native handle and a usage lock: presenting
// must be mutually exclusive with anything that mutates the swapchain
// (resize, recreate).

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Swapchain {
    /// The usage lock guards the handle itself, so a recreate can never
    /// interleave with a present.
    usage: Mutex<vk::SwapchainKHR>,
    out_of_date: AtomicBool,
}

impl Swapchain {
    /// Wraps a swapchain created by the window layer.
    pub fn from_raw(handle: vk::SwapchainKHR) -> Self {
        Self {
            usage: Mutex::new(handle),
            out_of_date: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        *self.usage.lock()
    }

    /// Locks the swapchain for exclusive use. Held by the present task for
    /// the duration of the present call.
    pub fn lock_usage(&self) -> MutexGuard<'_, vk::SwapchainKHR> {
        self.usage.lock()
    }

    /// Swaps in a recreated swapchain and returns the old handle for the
    /// caller to destroy.
    pub fn replace(&self, handle: vk::SwapchainKHR) -> vk::SwapchainKHR {
        let mut guard = self.usage.lock();
        let old = std::mem::replace(&mut *guard, handle);
        self.out_of_date.store(false, Ordering::Release);
        log::debug!("Swapchain replaced: {:?} -> {:?}", old, handle);
        old
    }

    /// Set when a present reported the swapchain suboptimal or out of date.
    pub fn is_out_of_date(&self) -> bool {
        self.out_of_date.load(Ordering::Acquire)
    }

    pub(crate) fn mark_out_of_date(&self) {
        self.out_of_date.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Swapchain");
        // Formatting must not wait on a present in progress
        match self.usage.try_lock() {
            Some(handle) => debug.field("handle", &*handle),
            None => debug.field("handle", &format_args!("<in use>")),
        };
        debug.field("out_of_date", &self.is_out_of_date()).finish()
    }
}
