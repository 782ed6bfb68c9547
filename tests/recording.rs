mod common;

use ash::vk::{self, Handle};
use common::{harness, harness_with, test_config};
use crossbeam_channel::{bounded, unbounded};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vk_submit::{
    CommandBufferHandle, CommandBufferState, CommandConfig, CommandError, CommandManager,
    DeviceCall, Fence, FenceInit, PresentInfo, RecordOrder, SubmitInfo, Swapchain,
};

fn submit_and_wait(
    manager: &CommandManager,
    fence: &Fence,
    handle: CommandBufferHandle,
) -> Result<(), CommandError> {
    manager.submit_async(
        SubmitInfo {
            fence: Some(fence.clone()),
            ..Default::default()
        },
        handle,
    )?;
    manager.wait_for_fence(fence)
}

#[test]
fn primary_buffers_alternate_between_frames() {
    let h = harness();
    let fence = Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap();

    let mut buffers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let handle = h.manager.record_async(|_| Ok(())).unwrap();
        buffers.push(h.manager.command_buffer(handle).unwrap());
        handles.push(handle);
        submit_and_wait(&h.manager, &fence, handle).unwrap();
        h.manager.reset_fence(&fence).unwrap();
    }

    assert_ne!(buffers[0], buffers[1]);
    assert_eq!(buffers[0], buffers[2]);
    assert_eq!(h.manager.command_buffer(handles[0]), Err(CommandError::StaleHandle));
    assert_eq!(h.manager.state(handles[1]), Ok(CommandBufferState::Submitted));
}

#[test]
fn encoder_receives_the_handle_buffer() {
    let h = harness();
    let (tx, rx) = unbounded();

    let handle = h
        .manager
        .record_async(move |command_buffer| {
            tx.send(command_buffer)?;
            Ok(())
        })
        .unwrap();
    let expected = h.manager.command_buffer(handle).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
}

#[test]
fn each_frame_resets_begins_ends_then_submits() {
    let h = harness();
    let fence = Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap();

    let handle = h.manager.record_async(|_| Ok(())).unwrap();
    let buffer = h.manager.command_buffer(handle).unwrap();
    submit_and_wait(&h.manager, &fence, handle).unwrap();

    let frame: Vec<DeviceCall> = h
        .device
        .calls()
        .into_iter()
        .filter(|call| !matches!(call, DeviceCall::WaitIdle))
        .collect();
    assert_eq!(frame.len(), 4);
    assert_eq!(frame[0], DeviceCall::ResetCommandBuffer(buffer));
    assert_eq!(frame[1], DeviceCall::BeginCommandBuffer(buffer));
    assert_eq!(frame[2], DeviceCall::EndCommandBuffer(buffer));
    assert!(matches!(
        &frame[3],
        DeviceCall::Submit { command_buffer, fence: submitted, .. }
            if *command_buffer == buffer && *submitted == fence.handle()
    ));
}

#[test]
fn failed_recording_reaches_the_fence_and_later_frames_recover() {
    let h = harness();
    let fence = Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap();

    let broken = h
        .manager
        .record_async(|_| Err(anyhow::anyhow!("missing pipeline")))
        .unwrap();
    let expected = CommandError::RecordingFailure {
        message: "missing pipeline".to_string(),
    };
    assert_eq!(submit_and_wait(&h.manager, &fence, broken), Err(expected.clone()));
    assert_eq!(h.manager.state(broken), Ok(CommandBufferState::Failed));
    assert_eq!(h.manager.error(broken), Ok(Some(expected)));
    assert_eq!(h.manager.device_error(), None);
    assert!(!h.device.calls().iter().any(|call| matches!(call, DeviceCall::Submit { .. })));

    h.manager.reset_fence(&fence).unwrap();
    let next = h.manager.record_async(|_| Ok(())).unwrap();
    submit_and_wait(&h.manager, &fence, next).unwrap();
    assert_eq!(h.manager.pending(), 0);
}

#[test]
fn panicking_encoder_fails_its_frame_only() {
    let h = harness();
    let fence = Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap();

    let broken = h.manager.record_async(|_| panic!("encoder bug")).unwrap();
    match submit_and_wait(&h.manager, &fence, broken) {
        Err(CommandError::RecordingFailure { message }) => assert!(message.contains("encoder bug")),
        other => panic!("expected a recording failure, got {:?}", other),
    }

    h.manager.reset_fence(&fence).unwrap();
    let next = h.manager.record_async(|_| Ok(())).unwrap();
    submit_and_wait(&h.manager, &fence, next).unwrap();
}

#[test]
fn freed_or_recycled_handles_are_rejected() {
    let h = harness();

    let freed = h.manager.record_async(|_| Ok(())).unwrap();
    h.manager.free(freed).unwrap();
    h.manager.free(freed).unwrap();
    assert_eq!(
        h.manager.submit_async(SubmitInfo::default(), freed),
        Err(CommandError::StaleHandle)
    );

    let _second = h.manager.record_async(|_| Ok(())).unwrap();
    let _third = h.manager.record_async(|_| Ok(())).unwrap();
    // `freed`'s buffer now belongs to `_third`
    assert_eq!(h.manager.state(freed), Err(CommandError::StaleHandle));
    assert_eq!(h.manager.free(freed), Err(CommandError::StaleHandle));
    assert_eq!(h.manager.pending(), 0);
}

#[test]
fn terminate_stops_recording_and_idles_the_device() {
    let h = harness();
    let fence = Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap();

    let handle = h.manager.record_async(|_| Ok(())).unwrap();
    submit_and_wait(&h.manager, &fence, handle).unwrap();

    h.manager.terminate().unwrap();
    h.manager.terminate().unwrap();

    let idles = h
        .device
        .calls()
        .iter()
        .filter(|call| matches!(call, DeviceCall::WaitIdle))
        .count();
    assert_eq!(idles, 1);
    assert!(matches!(
        h.manager.record_async(|_| Ok(())),
        Err(CommandError::WorkerStopped)
    ));
}

#[test]
fn no_submissions_after_terminate() {
    let h = harness();
    let recorded = h.manager.record_async(|_| Ok(())).unwrap();
    thread::sleep(Duration::from_millis(50));

    h.manager.terminate().unwrap();
    let calls_at_terminate = h.device.calls().len();

    assert_eq!(
        h.manager.submit_async(SubmitInfo::default(), recorded),
        Err(CommandError::WorkerStopped)
    );
    let swapchain = Arc::new(Swapchain::from_raw(vk::SwapchainKHR::from_raw(0x40)));
    let present = PresentInfo {
        swapchains: vec![swapchain],
        image_indices: vec![0],
        ..Default::default()
    };
    assert_eq!(h.manager.present_async(present), Err(CommandError::WorkerStopped));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(h.device.calls().len(), calls_at_terminate);
    assert_eq!(h.manager.pending(), 0);
}

#[test]
fn submission_left_behind_by_terminate_never_reaches_the_device() {
    let config = CommandConfig {
        shutdown_timeout_ms: 50,
        ..test_config()
    };
    let h = harness_with(config, 2);
    let fence = Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap();

    let (release_tx, release_rx) = bounded::<()>(1);
    let handle = h
        .manager
        .record_async(move |_| {
            release_rx.recv()?;
            Ok(())
        })
        .unwrap();
    h.manager
        .submit_async(
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
            handle,
        )
        .unwrap();

    // Finishes the recording only after terminate gave up waiting for it
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        release_tx.send(()).unwrap();
    });
    h.manager.terminate().unwrap();
    releaser.join().unwrap();

    assert_eq!(h.manager.wait_for_fence(&fence), Err(CommandError::WorkerStopped));
    assert_eq!(h.manager.device_error(), Some(CommandError::WorkerStopped));
    assert!(!h.device.calls().iter().any(|call| matches!(
        call,
        DeviceCall::EndCommandBuffer(_) | DeviceCall::Submit { .. }
    )));
}

#[test]
fn lifo_manager_still_submits_every_frame() {
    let config = CommandConfig {
        record_order: RecordOrder::Lifo,
        ..test_config()
    };
    let h = harness_with(config, 2);
    assert_eq!(h.manager.record_order(), RecordOrder::Lifo);

    let fences: Vec<Fence> = (0..2)
        .map(|_| Fence::new(h.device.as_ref(), FenceInit::Unsignaled).unwrap())
        .collect();

    for _ in 0..10 {
        for fence in &fences {
            let handle = h.manager.record_async(|_| Ok(())).unwrap();
            h.manager
                .submit_async(
                    SubmitInfo {
                        fence: Some(fence.clone()),
                        ..Default::default()
                    },
                    handle,
                )
                .unwrap();
        }
        for fence in &fences {
            h.manager.wait_for_fence(fence).unwrap();
            h.manager.reset_fence(fence).unwrap();
        }
    }

    let submits = h
        .device
        .queue_calls()
        .iter()
        .filter(|call| matches!(call, DeviceCall::Submit { .. }))
        .count();
    assert_eq!(submits, 20);
}
