//! Headless soak run on the software device.
//!
//! Drives the full frame pipeline against [`NullDevice`] with a simulated
//! per-submission latency, so slot reuse, binding-pool reclamation and
//! chain recreation all happen without a GPU.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use vkpipe_core::{RendererConfig, Timer};
use vkpipe_renderer::{FrameOutcome, GpuContext, descriptor_type};
use vkpipe_rhi::null::{CompletionMode, NullDevice, NullLayout};
use vkpipe_rhi::{RhiError, RhiResult, vk};

/// Skipped frames tolerated before the run gives up.
const MAX_SKIPPED: u64 = 16;

/// Summary of a headless run.
#[derive(Debug, Clone)]
pub struct SoakReport {
    pub frames: u64,
    pub skipped: u64,
    pub submitted: u64,
    pub completed: u64,
    pub pools_created: u64,
    pub recreations: u64,
    pub deletions: u64,
    pub average_frame_time: Duration,
    pub average_device_time: Option<Duration>,
    pub blocked: Duration,
    pub wall_time: Duration,
}

impl fmt::Display for SoakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Headless run: {} frames ({} skipped), {}/{} submissions completed, \
             {} binding pools, {} chain rebuilds, {} deferred deletions, \
             {:.2} ms avg frame, {} on device, {:.1} ms blocked, {:.1} ms total",
            self.frames,
            self.skipped,
            self.completed,
            self.submitted,
            self.pools_created,
            self.recreations,
            self.deletions,
            self.average_frame_time.as_secs_f64() * 1000.0,
            self.average_device_time
                .map_or("unmeasured".to_string(), |t| format!(
                    "{:.2} ms",
                    t.as_secs_f64() * 1000.0
                )),
            self.blocked.as_secs_f64() * 1000.0,
            self.wall_time.as_secs_f64() * 1000.0
        )
    }
}

/// Render `frames` frames on a device completing each submission after
/// `delay_ms` milliseconds.
///
/// Halfway through, the simulated surface shrinks so the presentation chain
/// goes stale and is rebuilt.
pub fn run(config: &RendererConfig, frames: u64, delay_ms: u64) -> RhiResult<SoakReport> {
    let device = Arc::new(NullDevice::with_mode(CompletionMode::Delayed(
        Duration::from_millis(delay_ms),
    )));
    device.set_event_logging(false);

    let extent = vk::Extent2D {
        width: config.presentation.width,
        height: config.presentation.height,
    };
    let mut context = GpuContext::new(Arc::clone(&device), config, extent)?;

    // One single-descriptor layout per configured category
    let layouts: Vec<NullLayout> = config
        .bindings
        .ratios
        .iter()
        .map(|ratio| NullLayout::single(descriptor_type(ratio.kind)))
        .collect();

    context.immediate().run(|commands| commands.push("upload palette"))?;
    info!(
        "Headless device ready: {} ms latency, {} frames in flight",
        delay_ms, config.frames.frames_in_flight
    );

    let deletions = Arc::new(AtomicU64::new(0));
    let mut rendered = 0;
    let mut skipped = 0;
    let mut timer = Timer::new();
    timer.begin();

    while rendered < frames {
        if rendered == frames / 2 && skipped == 0 {
            device.set_surface_extent(vk::Extent2D {
                width: (extent.width / 2).max(1),
                height: (extent.height / 2).max(1),
            });
        }

        let mut frame = match context.begin_frame()? {
            FrameOutcome::Ready(frame) => frame,
            FrameOutcome::Skipped => {
                skipped += 1;
                if skipped > MAX_SKIPPED {
                    return Err(RhiError::SwapchainError(format!(
                        "gave up after {skipped} skipped frames"
                    )));
                }
                continue;
            }
        };

        let image = frame.image_index()?;
        frame.record(|commands| commands.push(format!("clear image {image}")))?;
        for layout in &layouts {
            frame.binding_pool().allocate(layout)?;
        }
        let counter = Arc::clone(&deletions);
        frame.deletion_queue().push(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        GpuContext::end_frame(frame)?;
        rendered += 1;
    }

    context.drain()?;
    let wall_time = timer.end();
    if device.pending() != 0 {
        warn!("{} submissions still pending after drain", device.pending());
    }

    let stats = context.stats();
    let (average_frame_time, blocked) = (stats.average_frame_time(), stats.blocked());
    let average_device_time = stats.average_device_time();
    let recreations = context.presentation().recreations();
    drop(context);

    Ok(SoakReport {
        frames: rendered,
        skipped,
        submitted: device.submitted(),
        completed: device.completed(),
        pools_created: device.pools_created(),
        recreations,
        deletions: deletions.load(Ordering::Relaxed),
        average_frame_time,
        average_device_time,
        blocked,
        wall_time,
    })
}
