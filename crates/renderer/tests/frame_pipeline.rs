//! Integration tests for the frame pipeline on the headless device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vkpipe_core::RendererConfig;
use vkpipe_rhi::null::{CompletionMode, DeviceEvent, NullDevice, NullLayout};
use vkpipe_rhi::{ImageAcquire, PoolSizeRatio, PresentStatus, vk};
use vkpipe_renderer::{
    BindingPoolSettings, FrameOutcome, FrameRing, GpuContext, ImmediateChannel, PresentationSet,
};

const LONG_TIMEOUT: Duration = Duration::from_secs(5);

fn storage_settings(initial_tables: u32) -> BindingPoolSettings {
    BindingPoolSettings {
        initial_tables,
        max_tables: 64,
        ratios: vec![PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0)],
    }
}

fn storage_layout() -> NullLayout {
    NullLayout::single(vk::DescriptorType::STORAGE_IMAGE)
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

/// Route ring and device logs to the test output; later calls keep the first subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

#[test]
fn test_acquire_blocks_on_oldest_frame() {
    let device = Arc::new(NullDevice::with_mode(CompletionMode::Manual));
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");

    // The first N acquires never wait
    ring.acquire_next().unwrap().submit().unwrap();
    ring.acquire_next().unwrap().submit().unwrap();
    assert_eq!(device.completed(), 0);

    let completer = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let completed_before = device.completed();
            device.complete_next();
            completed_before
        })
    };

    let started = Instant::now();
    let frame = ring.acquire_next().unwrap();
    let waited = started.elapsed();

    assert_eq!(frame.slot_index(), 0);
    assert!(waited >= Duration::from_millis(40), "waited only {waited:?}");
    assert!(frame.waited() > Duration::ZERO);
    // Only the oldest submission had to finish
    assert_eq!(device.completed(), 1);
    assert_eq!(device.pending(), 1);
    assert_eq!(completer.join().unwrap(), 0);
}

#[test]
fn test_slot_deletions_run_in_reverse_order() {
    let device = Arc::new(NullDevice::new());
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut frame = ring.acquire_next().unwrap();
    for name in ["image", "view", "table"] {
        let log = Arc::clone(&log);
        frame
            .deletion_queue()
            .push(move || log.lock().unwrap().push(name));
    }
    frame.submit().unwrap();

    ring.acquire_next().unwrap().submit().unwrap();
    assert!(log.lock().unwrap().is_empty());

    ring.acquire_next().unwrap().submit().unwrap();
    assert_eq!(*log.lock().unwrap(), ["table", "view", "image"]);
}

#[test]
fn test_reclaimed_pools_are_reused() {
    let device = Arc::new(NullDevice::new());
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(4), LONG_TIMEOUT)
        .expect("Failed to create ring");
    let layout = storage_layout();

    // Warm up both slots: 4 + 6 tables, so each slot grows once
    for _ in 0..2 {
        let mut frame = ring.acquire_next().unwrap();
        for _ in 0..10 {
            frame.binding_pool().allocate(&layout).unwrap();
        }
        frame.submit().unwrap();
    }
    let pools = device.pools_created();
    assert_eq!(ring.slot_bindings(0).unwrap().full_pool_count(), 1);

    for _ in 0..20 {
        let mut frame = ring.acquire_next().unwrap();
        for _ in 0..10 {
            frame.binding_pool().allocate(&layout).unwrap();
        }
        frame.submit().unwrap();
    }
    assert_eq!(device.pools_created(), pools);
}

#[test]
fn test_twelve_tables_grow_pool_once() {
    let device = Arc::new(NullDevice::new());
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");
    let layout = storage_layout();

    let mut frame = ring.acquire_next().unwrap();
    let slot = frame.slot_index();
    let tables: Vec<_> = (0..12)
        .map(|_| frame.binding_pool().allocate(&layout).unwrap())
        .collect();
    frame.submit().unwrap();

    let bindings = ring.slot_bindings(slot).unwrap();
    assert_eq!(bindings.growth_events(), 1);
    assert_eq!(bindings.capacities(), [10, 15]);
    assert!(tables[..10].iter().all(|t| t.pool == tables[0].pool));
    assert_ne!(tables[10].pool, tables[0].pool);
    assert_eq!(tables[10].pool, tables[11].pool);
}

#[test]
fn test_immediate_run_blocks_for_device_delay() {
    let delay = Duration::from_millis(40);
    let device = Arc::new(NullDevice::with_mode(CompletionMode::Delayed(delay)));
    let mut immediate =
        ImmediateChannel::new(Arc::clone(&device), LONG_TIMEOUT).expect("Failed to create channel");

    let started = Instant::now();
    immediate.run(|commands| commands.push("upload")).unwrap();

    assert!(started.elapsed() >= delay);
    assert_eq!(device.completed(), 1);
}

#[test]
fn test_stale_chain_recreates_and_acquires_in_bounds() {
    let device = Arc::new(NullDevice::new());
    let mut presentation = PresentationSet::new(Arc::clone(&device), 3, LONG_TIMEOUT);
    presentation.create(extent(800, 600)).unwrap();
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");

    device.set_surface_extent(extent(1920, 1080));

    let mut frame = ring.acquire_next().unwrap();
    assert_eq!(frame.acquire_image(&presentation).unwrap(), ImageAcquire::Stale);
    frame.cancel();

    presentation.recreate(extent(1920, 1080)).unwrap();
    assert_eq!(presentation.extent(), extent(1920, 1080));

    let mut frame = ring.acquire_next().unwrap();
    let ImageAcquire::Ready { index, .. } = frame.acquire_image(&presentation).unwrap() else {
        panic!("acquire failed on a rebuilt chain");
    };
    assert!(index < presentation.image_count());

    let submitted = frame.submit().unwrap();
    assert_eq!(
        submitted.present(&presentation).unwrap(),
        PresentStatus::Presented
    );
}

#[test]
fn test_lagging_device_never_reuses_busy_slot() {
    init_tracing();
    const FRAMES: usize = 5;

    let device = Arc::new(NullDevice::with_mode(CompletionMode::Manual));
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");

    // Submission s completes only once submission s + 1 has been made and
    // the host is blocked reusing the slot of submission s
    let driver = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            for s in 1..FRAMES as u64 {
                assert!(device.wait_for_submissions(s + 1, LONG_TIMEOUT));
                if s + 2 <= FRAMES as u64 {
                    assert!(device.wait_for_fence_waiter(LONG_TIMEOUT));
                }
                device.complete_through(s);
            }
        })
    };

    let flushes: Arc<Vec<AtomicUsize>> = Arc::new((0..FRAMES).map(|_| AtomicUsize::new(0)).collect());
    let early_flushes = Arc::new(AtomicUsize::new(0));

    for k in 0..FRAMES {
        let mut frame = ring.acquire_next().unwrap();
        if k >= 2 {
            // Frame k reuses the slot of frame k - 2, submission k - 1
            assert!(device.completed() >= (k - 1) as u64);
            assert!(frame.waited() > Duration::ZERO);
        }

        let submission = (k + 1) as u64;
        let flushes = Arc::clone(&flushes);
        let early = Arc::clone(&early_flushes);
        let observer = Arc::clone(&device);
        frame.deletion_queue().push(move || {
            if observer.completed() < submission {
                early.fetch_add(1, Ordering::SeqCst);
            }
            flushes[k].fetch_add(1, Ordering::SeqCst);
        });
        frame.record(|commands| commands.push(format!("frame {k}"))).unwrap();
        frame.submit().unwrap();
    }

    driver.join().unwrap();
    drop(ring);

    for (k, count) in flushes.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "frame {k} flushed wrongly");
    }
    assert_eq!(early_flushes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_submit_leaves_ring_usable() {
    init_tracing();
    let device = Arc::new(NullDevice::new());
    let mut presentation = PresentationSet::new(Arc::clone(&device), 3, LONG_TIMEOUT);
    presentation.create(extent(640, 480)).unwrap();
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");

    let mut frame = ring.acquire_next().unwrap();
    frame.acquire_image(&presentation).unwrap();
    device.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    assert!(frame.submit().is_err());
    assert_eq!(device.submitted(), 0);

    // Every later frame acquires, submits and presents normally, including
    // the one reusing the slot whose image signal was never consumed.
    for _ in 0..6 {
        let mut frame = ring.acquire_next().unwrap();
        assert!(matches!(
            frame.acquire_image(&presentation).unwrap(),
            ImageAcquire::Ready { .. }
        ));
        let submitted = frame.submit().unwrap();
        assert_eq!(
            submitted.present(&presentation).unwrap(),
            PresentStatus::Presented
        );
    }
    assert_eq!(device.submitted(), 6);
}

#[test]
fn test_submissions_chain_acquire_render_present() {
    let device = Arc::new(NullDevice::new());
    let mut presentation = PresentationSet::new(Arc::clone(&device), 2, LONG_TIMEOUT);
    presentation.create(extent(320, 240)).unwrap();
    let mut ring = FrameRing::new(Arc::clone(&device), 2, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");
    device.take_events();

    let mut frame = ring.acquire_next().unwrap();
    frame.acquire_image(&presentation).unwrap();
    frame.submit().unwrap().present(&presentation).unwrap();

    let events = device.take_events();
    let acquired = events.iter().find_map(|e| match e {
        DeviceEvent::Acquired { signal, .. } => Some(*signal),
        _ => None,
    });
    let (wait, rendered) = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Submitted { wait, signal, .. } => Some((*wait, *signal)),
            _ => None,
        })
        .expect("no submission recorded");
    let presented_after = events.iter().find_map(|e| match e {
        DeviceEvent::Presented { wait, .. } => Some(*wait),
        _ => None,
    });

    assert_eq!(wait, acquired);
    assert!(rendered.is_some());
    assert_eq!(presented_after, rendered);
}

#[test]
fn test_context_recovers_from_stale_chain() {
    init_tracing();
    let device = Arc::new(NullDevice::new());
    let mut context = GpuContext::new(
        Arc::clone(&device),
        &RendererConfig::default(),
        extent(800, 600),
    )
    .expect("Failed to create context");

    let FrameOutcome::Ready(frame) = context.begin_frame().unwrap() else {
        panic!("first frame skipped");
    };
    GpuContext::end_frame(frame).unwrap();

    device.set_surface_extent(extent(1024, 768));
    assert!(matches!(
        context.begin_frame().unwrap(),
        FrameOutcome::Skipped
    ));
    assert_eq!(context.presentation().recreations(), 1);
    assert_eq!(context.presentation().extent(), extent(1024, 768));

    let FrameOutcome::Ready(frame) = context.begin_frame().unwrap() else {
        panic!("frame skipped after recreation");
    };
    let index = frame.image_index().unwrap();
    assert!(index < frame.presentation().image_count());
    assert_eq!(
        GpuContext::end_frame(frame).unwrap(),
        PresentStatus::Presented
    );
}

#[test]
fn test_context_shutdown_order() {
    let device = Arc::new(NullDevice::with_mode(CompletionMode::Manual));
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let mut context = GpuContext::new(
            Arc::clone(&device),
            &RendererConfig::default(),
            extent(64, 64),
        )
        .expect("Failed to create context");

        let global = Arc::clone(&log);
        context
            .deletion_queue()
            .push(move || global.lock().unwrap().push("global"));

        let FrameOutcome::Ready(mut frame) = context.begin_frame().unwrap() else {
            panic!("frame skipped");
        };
        let per_frame = Arc::clone(&log);
        frame
            .deletion_queue()
            .push(move || per_frame.lock().unwrap().push("frame"));
        GpuContext::end_frame(frame).unwrap();

        // Still in flight
        assert_eq!(device.pending(), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    assert_eq!(device.pending(), 0);
    assert_eq!(*log.lock().unwrap(), ["frame", "global"]);
}

#[test]
fn test_soak_on_delayed_device() {
    init_tracing();
    let device = Arc::new(NullDevice::with_mode(CompletionMode::Delayed(
        Duration::from_millis(1),
    )));
    device.set_event_logging(false);
    let mut config = RendererConfig::default();
    config.frames.frames_in_flight = 3;
    config.bindings.initial_tables = 16;
    let mut context = GpuContext::new(Arc::clone(&device), &config, extent(128, 128))
        .expect("Failed to create context");
    let layout = NullLayout::single(vk::DescriptorType::UNIFORM_BUFFER);
    let deletions = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
        let FrameOutcome::Ready(mut frame) = context.begin_frame().unwrap() else {
            panic!("frame skipped on a fixed surface");
        };
        for _ in 0..4 {
            frame.binding_pool().allocate(&layout).unwrap();
        }
        let counter = Arc::clone(&deletions);
        frame.deletion_queue().push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        GpuContext::end_frame(frame).unwrap();
    }

    // One pool per slot plus the global one, never more
    assert_eq!(device.pools_created(), 4);
    assert_eq!(context.stats().frames(), 200);

    drop(context);
    assert_eq!(deletions.load(Ordering::SeqCst), 200);
}

#[test]
fn test_unpresented_frame_leaves_slot_usable() {
    init_tracing();
    let device = Arc::new(NullDevice::new());
    let mut presentation = PresentationSet::new(Arc::clone(&device), 3, LONG_TIMEOUT);
    presentation.create(extent(320, 240)).unwrap();
    let mut ring = FrameRing::new(Arc::clone(&device), 1, &storage_settings(10), LONG_TIMEOUT)
        .expect("Failed to create ring");

    // Rendered into an image that is then never presented
    let mut frame = ring.acquire_next().unwrap();
    frame.acquire_image(&presentation).unwrap();
    let submitted = frame.submit().unwrap();
    assert_eq!(submitted.image_index(), Some(0));
    drop(submitted);

    for _ in 0..4 {
        let mut frame = ring.acquire_next().unwrap();
        assert!(matches!(
            frame.acquire_image(&presentation).unwrap(),
            ImageAcquire::Ready { .. }
        ));
        let submitted = frame.submit().unwrap();
        assert_eq!(
            submitted.present(&presentation).unwrap(),
            PresentStatus::Presented
        );
    }
    assert_eq!(device.submitted(), 5);
}

#[test]
fn test_device_time_follows_delayed_completion() {
    init_tracing();
    let delay = Duration::from_millis(10);
    let device = Arc::new(NullDevice::with_mode(CompletionMode::Delayed(delay)));
    let mut config = RendererConfig::default();
    config.frames.frames_in_flight = 2;
    let mut context = GpuContext::new(Arc::clone(&device), &config, extent(64, 64))
        .expect("Failed to create context");

    for k in 0..5 {
        let FrameOutcome::Ready(frame) = context.begin_frame().unwrap() else {
            panic!("frame skipped on a fixed surface");
        };
        // Slots report once they come round again
        match frame.device_time() {
            Some(elapsed) => assert!(k >= 2 && elapsed >= delay, "frame {k}: {elapsed:?}"),
            None => assert!(k < 2, "frame {k} has no device time"),
        }
        GpuContext::end_frame(frame).unwrap();
    }

    assert_eq!(context.stats().device_frames(), 3);
    assert!(context.stats().device_time().unwrap() >= delay);
}
