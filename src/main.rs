// =============================================================================
// HEADLESS SUBMISSION DEMO
// =============================================================================
//
// Drives a short double-buffered frame loop through the command manager:
//
// FRAME FLOW:
// 1. Wait for the fence of the frame that last used this slot
// 2. Reset it
// 3. Record (on the recording thread)
// 4. Submit (on the worker pool, in ticket order)
//
// Runs against the real Vulkan device when one is available and against the
// in-memory device otherwise.
//
// =============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use vk_submit::{
    init_logging, CommandManager, Config, Fence, FenceInit, GpuDevice, NullDevice, SubmitInfo,
    TaskPool, VulkanDevice,
};

const FRAME_COUNT: usize = 240;
const FRAMES_IN_FLIGHT: usize = 2;

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config.debug);
    log::info!("Starting headless submission demo");

    let device: Arc<dyn GpuDevice> =
        match VulkanDevice::new("vk-submit-demo", config.debug.validation_layers) {
            Ok(device) => device as Arc<dyn GpuDevice>,
            Err(e) => {
                log::warn!("Vulkan unavailable ({:#}), using the null device", e);
                Arc::new(NullDevice::new())
            }
        };

    let pool = Arc::new(TaskPool::from_config(&config.pool)?);
    let manager = CommandManager::initialize(device.clone(), pool.clone(), config.commands.clone())?;

    // Start signaled so the first wait on each slot returns immediately
    let fences = (0..FRAMES_IN_FLIGHT)
        .map(|_| Fence::new(device.as_ref(), FenceInit::Signaled))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to create frame fences")?;

    let start = Instant::now();
    for frame in 0..FRAME_COUNT {
        let fence = &fences[frame % FRAMES_IN_FLIGHT];
        manager.wait_for_fence(fence)?;
        manager.reset_fence(fence)?;

        let handle = manager.record_async(move |command_buffer| {
            log::trace!("Recording frame {} into {:?}", frame, command_buffer);
            Ok(())
        })?;
        manager.submit_async(
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
            handle,
        )?;
    }

    for fence in &fences {
        manager.wait_for_fence(fence)?;
    }
    let elapsed = start.elapsed();
    log::info!(
        "{} frames in {:.2?} ({:.1} us/frame)",
        FRAME_COUNT,
        elapsed,
        elapsed.as_secs_f64() * 1e6 / FRAME_COUNT as f64
    );

    manager.terminate()?;
    for fence in &fences {
        fence.destroy(device.as_ref());
    }
    pool.shutdown();

    log::info!("Cleanup complete");
    Ok(())
}
