mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use parking_lot::Mutex;

use kestrel_rhi::{
    BufferDescriptor, ColorAttachment, CommandBufferStatus, CommandEncoder, CommandQueue, CompletionStatus, DeviceState, EventLoop,
    IndexFormat, PassKind, QueueCapability, RenderPassDescriptor, RhiError, StorageMode, TextureDescriptor, TextureFormat,
    TextureRegion, TextureUsage,
};

use common::{device, device_with_event_loop, device_with_latency, software, triangle_pipeline, wait_for};

#[test]
fn passes_execute_in_encoder_creation_order() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let target = device
        .create_texture(&TextureDescriptor::render_target("target", 8, 8, TextureFormat::Rgba8Unorm))
        .unwrap();
    let scratch = device.create_buffer(&BufferDescriptor::staging("scratch", 256)).unwrap();

    let mut cb = queue.create_command_buffer().unwrap();
    for round in 0..3 {
        {
            let mut blit = cb.create_blit_command_encoder().unwrap();
            blit.fill_buffer(&scratch, 0, 256, round).unwrap();
            blit.end_encoding().unwrap();
        }
        cb.create_compute_command_encoder().unwrap().end_encoding().unwrap();

        let pass = RenderPassDescriptor::new(&format!("render {round}")).with_color_attachment(ColorAttachment::new(&target));
        cb.create_render_command_encoder(&pass).unwrap().end_encoding().unwrap();
    }
    assert_eq!(cb.finished_count(), 9);
    assert!(cb.commit().unwrap());
    assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Completed);

    let log = software(&device).take_execution_log();
    let order: Vec<u32> = log.iter().map(|pass| pass.pass_index).collect();
    assert_eq!(order, (0..9).collect::<Vec<_>>());
    let kinds: Vec<PassKind> = log.iter().take(3).map(|pass| pass.kind).collect();
    assert_eq!(kinds, [PassKind::Blit, PassKind::Compute, PassKind::Render]);
    assert!(log.iter().all(|pass| pass.submission == log[0].submission));

    // The last fill wins.
    assert_eq!(scratch.read_range(..).unwrap(), vec![2u8; 256]);
}

#[test]
fn empty_commit_is_a_no_op() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let mut cb = queue.create_command_buffer().unwrap();

    assert!(!cb.commit().unwrap());
    assert_eq!(cb.status(), CommandBufferStatus::Recording);
    assert!(matches!(cb.wait_until_completed(), Err(RhiError::InvalidState(_))));
    assert_eq!(queue.stats().submissions, 0);

    // Still usable after the no-op.
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    assert!(cb.commit().unwrap());
    assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
}

#[test]
fn committed_buffers_reject_further_recording() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Compute).unwrap();
    let mut cb = queue.create_command_buffer().unwrap();
    {
        let mut compute = cb.create_compute_command_encoder().unwrap();
        compute.end_encoding().unwrap();
        // Ending twice is harmless.
        compute.end_encoding().unwrap();
        assert!(!compute.is_open());
    }
    assert!(cb.commit().unwrap());

    assert!(matches!(cb.create_blit_command_encoder(), Err(RhiError::InvalidState(_))));
    assert!(matches!(cb.add_completed_handler(|_| {}), Err(RhiError::InvalidState(_))));
    assert!(matches!(cb.commit(), Err(RhiError::InvalidState(_))));
    cb.wait_until_completed().unwrap();
}

#[test]
fn transfer_queues_cannot_render() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    assert!(!queue.capabilities().contains(QueueCapability::Graphics));

    let target = device
        .create_texture(&TextureDescriptor::render_target("target", 4, 4, TextureFormat::Rgba8Unorm))
        .unwrap();
    let mut cb = queue.create_command_buffer().unwrap();
    let pass = RenderPassDescriptor::new("pass").with_color_attachment(ColorAttachment::new(&target));
    assert!(matches!(cb.create_render_command_encoder(&pass), Err(RhiError::DeviceCapability(_))));
    assert!(matches!(cb.create_compute_command_encoder(), Err(RhiError::DeviceCapability(_))));
}

#[test]
fn fences_are_recycled_across_submissions() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();

    for _ in 0..10 {
        let mut cb = queue.create_command_buffer().unwrap();
        cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
        cb.commit().unwrap();
        assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
        // The fence goes back to the pool right after the handlers ran.
        assert!(wait_for(|| device.fence_pool_stats().in_flight == 0));
    }

    let stats = device.fence_pool_stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.retired, 0);
    assert_eq!(stats.free, stats.created);

    // Native command buffers come back to the thread's pool as well.
    let queue_stats = queue.stats();
    assert_eq!(queue_stats.thread_pools, 1);
    assert_eq!(queue_stats.native_command_buffers, 1);
    assert_eq!(queue_stats.submissions, 10);
}

#[test]
fn every_handler_fires_exactly_once_under_concurrent_registration() {
    const THREADS: usize = 4;
    const BUFFERS: usize = 25;

    let device = device();
    let queue = device.create_command_queue(QueueCapability::Compute).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = queue.clone();
            let fired = fired.clone();
            thread::spawn(move || {
                let mut completions = Vec::new();
                for _ in 0..BUFFERS {
                    let mut cb = queue.create_command_buffer().unwrap();
                    cb.create_compute_command_encoder().unwrap().end_encoding().unwrap();
                    let fired = fired.clone();
                    cb.add_completed_handler(move |status| {
                        assert_eq!(status, CompletionStatus::Completed);
                        fired.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                    cb.commit().unwrap();
                    completions.push(cb.completion());
                }
                for completion in completions {
                    assert_eq!(completion.wait().unwrap(), CommandBufferStatus::Completed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(wait_for(|| device.notifier_stats().delivered == (THREADS * BUFFERS) as u64));
    assert_eq!(fired.load(Ordering::SeqCst), THREADS * BUFFERS);
    assert_eq!(queue.stats().thread_pools, THREADS);
    assert_eq!(device.notifier_stats().registered, (THREADS * BUFFERS) as u64);
}

#[test]
fn pools_of_exited_threads_are_pruned() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let submit_from_new_thread = |queue: &CommandQueue| {
        let queue = queue.clone();
        thread::spawn(move || {
            let mut cb = queue.create_command_buffer().unwrap();
            cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
            cb.commit().unwrap();
            assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
        })
        .join()
        .unwrap();
    };

    submit_from_new_thread(&queue);
    assert_eq!(queue.stats().thread_pools, 1);
    submit_from_new_thread(&queue);
    assert_eq!(queue.stats().thread_pools, 1);

    // A live thread keeps its pool even while idle.
    let cb = queue.create_command_buffer().unwrap();
    drop(cb);
    submit_from_new_thread(&queue);
    assert_eq!(queue.stats().thread_pools, 2);
}

#[test]
fn handlers_of_one_buffer_run_in_registration_order() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut cb = queue.create_command_buffer().unwrap();
    for index in 0..5 {
        let seen = seen.clone();
        cb.add_completed_handler(move |_| seen.lock().push(index)).unwrap();
    }
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    cb.commit().unwrap();
    cb.wait_until_completed().unwrap();

    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn dropping_an_uncommitted_buffer_cancels_its_handlers() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let status = Arc::new(Mutex::new(None));

    let completion = {
        let mut cb = queue.create_command_buffer().unwrap();
        let status = status.clone();
        cb.add_completed_handler(move |s| *status.lock() = Some(s)).unwrap();
        cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
        cb.completion()
    };

    assert_eq!(*status.lock(), Some(CompletionStatus::Cancelled));
    assert_eq!(completion.status(), CommandBufferStatus::Cancelled);
    assert_eq!(queue.stats().submissions, 0);
}

#[test]
fn shutdown_drains_in_flight_work() {
    let device = device_with_latency(Duration::from_millis(150));
    let queue = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let status = Arc::new(Mutex::new(None));

    let mut cb = queue.create_command_buffer().unwrap();
    {
        let status = status.clone();
        cb.add_completed_handler(move |s| *status.lock() = Some(s)).unwrap();
    }
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    cb.commit().unwrap();
    assert_eq!(cb.status(), CommandBufferStatus::Committed);

    device.shutdown();

    assert_eq!(*status.lock(), Some(CompletionStatus::Completed));
    assert_eq!(cb.status(), CommandBufferStatus::Completed);
    assert_eq!(device.state(), DeviceState::Destroyed);
    assert!(matches!(device.create_command_queue(QueueCapability::Graphics), Err(RhiError::ShuttingDown)));
    assert!(matches!(queue.create_command_buffer(), Err(RhiError::ShuttingDown)));

    // Idempotent.
    device.shutdown();
}

#[test]
fn stalled_work_stays_committed_until_resumed() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    software(&device).stall();

    let mut cb = queue.create_command_buffer().unwrap();
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    cb.commit().unwrap();

    assert_eq!(cb.wait_until_completed_timeout(Duration::from_millis(50)).unwrap(), None);
    assert_eq!(cb.status(), CommandBufferStatus::Committed);

    software(&device).resume();
    assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
}

#[test]
fn rejected_submission_fails_the_buffer_and_degrades_the_device() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    software(&device).fail_next_submissions(1);

    let status = Arc::new(Mutex::new(None));
    let mut cb = queue.create_command_buffer().unwrap();
    {
        let status = status.clone();
        cb.add_completed_handler(move |s| *status.lock() = Some(s)).unwrap();
    }
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();

    assert!(!device.is_degraded());
    assert!(matches!(cb.commit(), Err(RhiError::Submission(_))));
    assert_eq!(cb.status(), CommandBufferStatus::Failed);
    assert_eq!(*status.lock(), Some(CompletionStatus::Failed));
    assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Failed);
    assert!(device.is_degraded());
    assert_eq!(device.fence_pool_stats().in_flight, 0);

    // The next submission goes through; the device stays flagged.
    let mut retry = queue.create_command_buffer().unwrap();
    retry.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    assert!(retry.commit().unwrap());
    assert_eq!(retry.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
    assert!(device.is_degraded());
}

#[test]
fn event_loop_handlers_run_on_the_pumping_thread() {
    let event_loop = EventLoop::new();
    let device = device_with_event_loop(event_loop.proxy());
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let ran_on = Arc::new(Mutex::new(None));

    let mut cb = queue.create_command_buffer().unwrap();
    {
        let ran_on = ran_on.clone();
        cb.add_completed_handler_on_event_loop(move |status| {
            assert_eq!(status, CompletionStatus::Completed);
            *ran_on.lock() = Some(thread::current().id());
        })
        .unwrap();
    }
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    cb.commit().unwrap();

    assert!(event_loop.run_until(Duration::from_secs(5), || ran_on.lock().is_some()));
    assert_eq!(*ran_on.lock(), Some(thread::current().id()));
}

#[test]
fn event_loop_handlers_survive_an_unpumped_shutdown() {
    let event_loop = EventLoop::new();
    let device = device_with_event_loop(event_loop.proxy());
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let status = Arc::new(Mutex::new(None));
    let late = Arc::new(Mutex::new(None));

    let mut cb = queue.create_command_buffer().unwrap();
    {
        let status = status.clone();
        cb.add_completed_handler_on_event_loop(move |s| *status.lock() = Some(s)).unwrap();
    }
    cb.create_blit_command_encoder().unwrap().end_encoding().unwrap();
    cb.commit().unwrap();

    let mut abandoned = queue.create_command_buffer().unwrap();
    {
        let late = late.clone();
        abandoned.add_completed_handler_on_event_loop(move |s| *late.lock() = Some(s)).unwrap();
    }

    device.shutdown();
    assert_eq!(cb.status(), CommandBufferStatus::Completed);
    assert_eq!(event_loop.pending(), 1);
    assert_eq!(*status.lock(), None);

    // The application tears down without pumping the loop again.
    drop(event_loop);
    assert_eq!(*status.lock(), Some(CompletionStatus::Completed));

    // With the loop gone, deliveries run on the calling thread.
    drop(abandoned);
    assert_eq!(*late.lock(), Some(CompletionStatus::Cancelled));
}

#[test]
fn empty_render_pass_still_clears_its_attachments() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let desc = TextureDescriptor::render_target("color", 4, 2, TextureFormat::Rgba8Unorm).with_storage_mode(StorageMode::Shared);
    let target = device.create_texture(&desc).unwrap();

    let mut cb = queue.create_command_buffer().unwrap();
    let pass = RenderPassDescriptor::new("clear").with_color_attachment(ColorAttachment::new(&target).with_clear_color([1.0, 0.0, 0.0, 1.0]));
    {
        let mut render = cb.create_render_command_encoder(&pass).unwrap();
        assert_eq!(render.draw_count(), 0);
        render.end_encoding().unwrap();
    }
    cb.commit().unwrap();
    cb.wait_until_completed().unwrap();

    let texels = target.read_region(&TextureRegion::whole(&desc, 0, 0)).unwrap();
    assert_eq!(texels.len(), 4 * 2 * 4);
    assert!(texels.chunks_exact(4).all(|texel| texel == [255, 0, 0, 255]));

    let log = software(&device).take_execution_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, PassKind::Render);
    assert_eq!(log[0].label, "clear");
    assert_eq!(log[0].draws, 0);
}

#[test]
fn render_passes_record_pipelines_and_draws() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let target = device
        .create_texture(&TextureDescriptor::render_target("color", 8, 8, TextureFormat::Rgba8Unorm))
        .unwrap();
    let indices = device.create_buffer(&BufferDescriptor::index("indices", 64)).unwrap();
    let pipeline = device.create_render_pipeline(&triangle_pipeline(&device, TextureFormat::Rgba8Unorm)).unwrap();

    let mut cb = queue.create_command_buffer().unwrap();
    let pass = RenderPassDescriptor::new("triangles").with_color_attachment(ColorAttachment::new(&target));
    {
        let mut render = cb.create_render_command_encoder(&pass).unwrap();
        render.set_render_pipeline(&pipeline);
        render.push_constants(0, &[]);
        render.draw(3, 1, 0, 0);
        render.set_index_buffer(&indices, 0, IndexFormat::Uint16);
        render.draw_indexed(6, 2, 0, 0, 0);
        assert_eq!(render.draw_count(), 2);
        render.end_encoding().unwrap();
    }
    cb.commit().unwrap();
    assert_eq!(cb.wait_until_completed().unwrap(), CommandBufferStatus::Completed);

    let log = software(&device).take_execution_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, PassKind::Render);
    assert_eq!(log[0].draws, 2);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "but the pass has")]
fn pipelines_must_match_the_pass_formats() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let target = device
        .create_texture(&TextureDescriptor::render_target("color", 8, 8, TextureFormat::Bgra8Unorm))
        .unwrap();
    let pipeline = device.create_render_pipeline(&triangle_pipeline(&device, TextureFormat::Rgba8Unorm)).unwrap();

    let mut cb = queue.create_command_buffer().unwrap();
    let pass = RenderPassDescriptor::new("mismatch").with_color_attachment(ColorAttachment::new(&target));
    let mut render = cb.create_render_command_encoder(&pass).unwrap();
    render.set_render_pipeline(&pipeline);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "recorded on closed encoder")]
fn recording_after_end_encoding_fails_fast() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let scratch = device.create_buffer(&BufferDescriptor::staging("scratch", 16)).unwrap();

    let mut cb = queue.create_command_buffer().unwrap();
    let mut blit = cb.create_blit_command_encoder().unwrap();
    blit.end_encoding().unwrap();
    let _ = blit.fill_buffer(&scratch, 0, 16, 1);
}

#[test]
fn texture_round_trips_through_blits() {
    let device = device();
    let queue = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let desc = TextureDescriptor::new_2d("image", 4, 4, TextureFormat::R8Unorm)
        .with_usage(TextureUsage::CopySrc | TextureUsage::CopyDst);
    let texture = device.create_texture(&desc).unwrap();
    let upload = device.create_buffer(&BufferDescriptor::staging("upload", 16)).unwrap();
    let readback = device.create_buffer(&BufferDescriptor::staging("readback", 32)).unwrap();
    let pixels: Vec<u8> = (0..16).collect();
    upload.write(0, &pixels).unwrap();

    let mut cb = queue.create_command_buffer().unwrap();
    {
        let mut blit = cb.create_blit_command_encoder().unwrap();
        let region = TextureRegion::whole(&desc, 0, 0);
        blit.copy_buffer_to_texture(&upload, 0, 4, &texture, region).unwrap();
        // Padded rows on the way back.
        blit.copy_texture_to_buffer(&texture, region, &readback, 0, 8).unwrap();
        assert!(matches!(
            blit.copy_texture_to_buffer(&texture, region, &readback, 0, 2),
            Err(RhiError::InvalidDescriptor(_))
        ));
        blit.end_encoding().unwrap();
    }
    cb.commit().unwrap();
    cb.wait_until_completed().unwrap();

    let bytes = readback.read_range(..).unwrap();
    for row in 0..4 {
        assert_eq!(&bytes[row * 8..row * 8 + 4], &pixels[row * 4..row * 4 + 4]);
    }
}

#[test]
fn events_order_work_across_queues() {
    let device = device();
    let transfer = device.create_command_queue(QueueCapability::Transfer).unwrap();
    let graphics = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let event = device.create_event("upload done").unwrap();
    let src = device.create_buffer(&BufferDescriptor::staging("src", 64)).unwrap();
    let dst = device.create_buffer(&BufferDescriptor::staging("dst", 64)).unwrap();

    // The consumer is submitted first and must not run before the producer signals.
    let mut consumer = graphics.create_command_buffer().unwrap();
    {
        let mut copy = consumer.create_blit_command_encoder().unwrap();
        copy.wait_event(&event);
        copy.copy_buffer_to_buffer(&src, 0, &dst, 0, 64).unwrap();
        copy.end_encoding().unwrap();
    }
    consumer.commit().unwrap();

    let mut producer = transfer.create_command_buffer().unwrap();
    {
        let mut fill = producer.create_blit_command_encoder().unwrap();
        fill.fill_buffer(&src, 0, 64, 7).unwrap();
        fill.signal_event(&event);
        fill.end_encoding().unwrap();
    }
    producer.commit().unwrap();

    assert_eq!(consumer.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
    assert_eq!(dst.read_range(..).unwrap(), vec![7u8; 64]);
}

#[test]
fn semaphores_count_up_across_submissions() {
    let device = device();
    let compute = device.create_command_queue(QueueCapability::Compute).unwrap();
    let graphics = device.create_command_queue(QueueCapability::Graphics).unwrap();
    let timeline = device.create_semaphore("timeline").unwrap();
    assert_eq!(timeline.completed_value().unwrap(), 0);

    let mut first = compute.create_command_buffer().unwrap();
    {
        let mut pass = first.create_compute_command_encoder().unwrap();
        pass.signal_semaphore(&timeline, 1);
        pass.end_encoding().unwrap();
    }

    let mut second = graphics.create_command_buffer().unwrap();
    {
        let mut pass = second.create_blit_command_encoder().unwrap();
        pass.wait_semaphore(&timeline, 1);
        pass.signal_semaphore(&timeline, 2);
        pass.end_encoding().unwrap();
    }

    second.commit().unwrap();
    first.commit().unwrap();
    assert_eq!(second.wait_until_completed().unwrap(), CommandBufferStatus::Completed);
    assert_eq!(timeline.completed_value().unwrap(), 2);
}

#[test]
fn unusable_buffers_are_rejected() {
    let device = device();
    let empty = BufferDescriptor::new("empty", 0);
    assert!(matches!(device.create_buffer(&empty), Err(RhiError::InvalidDescriptor(_))));

    let memoryless = BufferDescriptor::new("tile", 64).with_storage_mode(StorageMode::Memoryless);
    assert!(matches!(device.create_buffer(&memoryless), Err(RhiError::InvalidDescriptor(_))));

    let huge = BufferDescriptor::new("huge", device.limits().max_buffer_size + 1);
    assert!(matches!(device.create_buffer(&huge), Err(RhiError::InvalidDescriptor(_))));

    // The software device has no lazily allocated memory.
    let tile = TextureDescriptor::new_2d("tile", 16, 16, TextureFormat::Rgba8Unorm)
        .with_usage(TextureUsage::RenderTarget.into())
        .with_storage_mode(StorageMode::Memoryless);
    assert!(matches!(device.create_texture(&tile), Err(RhiError::DeviceCapability(_))));

    let private = device.create_buffer(&BufferDescriptor::new("private", 16)).unwrap();
    assert!(matches!(private.write(0, &[1, 2, 3]), Err(RhiError::InvalidState(_))));
    assert_eq!(device.resource_stats().count(kestrel_rhi::ResourceKind::Buffer), 1);
}
