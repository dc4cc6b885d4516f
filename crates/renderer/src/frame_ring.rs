//! Frame slot ring.
//!
//! The [`FrameRing`] owns N frame slots and lets the host record frame
//! `k + 1` while the device is still executing frame `k`. Each slot holds
//! everything one in-flight frame touches:
//!
//! - a command recording context
//! - two ordering signals, `acquired` and `rendered`
//! - one completion signal, `idle`
//! - a deletion queue and a binding-table allocator scoped to the slot
//!
//! # Slot lifecycle
//!
//! ```text
//! Idle ──acquire_next──> Recording ──submit──> Submitted ──(device)──> Idle
//!                            │
//!                            └── dropped without submit: aborted, back to Idle
//! ```
//!
//! [`FrameRing::acquire_next`] is the only place the host blocks on frame
//! progress: it waits for the slot's previous submission, then flushes the
//! slot's deletion queue, reclaims its binding pools, and opens its
//! recording context. The returned [`Frame`] borrows the ring mutably, so
//! only one slot can be recording at a time.
//!
//! # Device timing
//!
//! When the backend offers timestamp queries, slot `i` owns queries `2i` and
//! `2i + 1` and brackets every frame it records with them. The pair is read
//! back after the slot's fence wait, so [`Frame::device_time`] reports the
//! device time of the previous frame that used the same slot.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vkpipe_rhi::null::NullDevice;
//! use vkpipe_renderer::{BindingPoolSettings, FrameRing};
//!
//! # fn main() -> vkpipe_rhi::RhiResult<()> {
//! let device = Arc::new(NullDevice::new());
//! let mut ring = FrameRing::new(
//!     device,
//!     2,
//!     &BindingPoolSettings::default(),
//!     Duration::from_secs(1),
//! )?;
//!
//! for _ in 0..4 {
//!     let mut frame = ring.acquire_next()?;
//!     frame.record(|commands| commands.push("draw"))?;
//!     frame.deletion_queue().push(|| {});
//!     frame.submit()?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::{debug, error, info, warn};

use vkpipe_rhi::{
    GpuBackend, ImageAcquire, PresentBackend, PresentStatus, RhiError, RhiResult, SubmitSync,
};

use crate::binding_allocator::BindingTableAllocator;
use crate::deletion_queue::DeletionQueue;
use crate::presentation::PresentationSet;
use crate::BindingPoolSettings;

/// Where a slot is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Free for the next acquire without waiting.
    Idle,
    /// Handed out to the host; nothing has been queued yet.
    Recording,
    /// Queued on the device; the host must wait on `idle` before reuse.
    Submitted,
}

struct FrameSlot<B: GpuBackend> {
    commands: B::CommandContext,
    acquired: B::Semaphore,
    rendered: B::Semaphore,
    idle: B::Fence,
    deletion_queue: DeletionQueue,
    bindings: BindingTableAllocator<B>,
    state: SlotState,
    /// `acquired` was signalled by an image acquire nothing has waited on yet.
    acquire_pending: bool,
    /// `rendered` will be signalled by a submission no present has waited on yet.
    present_pending: bool,
    /// The last submission wrote this slot's timestamp pair.
    timed: bool,
}

impl<B: GpuBackend> FrameSlot<B> {
    fn new(backend: &Arc<B>, bindings: &BindingPoolSettings) -> RhiResult<Self> {
        Ok(Self {
            commands: backend.create_command_context()?,
            acquired: backend.create_semaphore()?,
            rendered: backend.create_semaphore()?,
            idle: backend.create_fence(true)?,
            deletion_queue: DeletionQueue::new(),
            bindings: BindingTableAllocator::new(
                Arc::clone(backend),
                bindings.initial_tables,
                bindings.max_tables,
                &bindings.ratios,
            )?,
            state: SlotState::Idle,
            acquire_pending: false,
            present_pending: false,
            timed: false,
        })
    }
}

/// Fixed ring of frame slots.
pub struct FrameRing<B: GpuBackend> {
    backend: Arc<B>,
    slots: Vec<FrameSlot<B>>,
    /// Frames handed out so far; the next one uses slot `frame_number % N`.
    frame_number: u64,
    fence_timeout: Duration,
    last_wait: Duration,
    timestamps: Option<B::TimestampPool>,
    last_device_time: Option<Duration>,
}

/// First timestamp query owned by `slot`.
#[inline]
fn query_base(slot: usize) -> u32 {
    2 * slot as u32
}

impl<B: GpuBackend> FrameRing<B> {
    /// Create `frames_in_flight` slots.
    ///
    /// # Errors
    ///
    /// A ring of zero slots is a [`RhiError::ContractViolation`]; backend
    /// failures creating slot objects are returned as is.
    pub fn new(
        backend: Arc<B>,
        frames_in_flight: usize,
        bindings: &BindingPoolSettings,
        fence_timeout: Duration,
    ) -> RhiResult<Self> {
        if frames_in_flight == 0 {
            return Err(RhiError::ContractViolation(
                "a frame ring needs at least one slot".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for i in 0..frames_in_flight {
            slots.push(FrameSlot::new(&backend, bindings)?);
            debug!("Created frame slot {}", i);
        }

        let timestamps = backend.create_timestamp_pool(query_base(frames_in_flight))?;
        if timestamps.is_none() {
            debug!("No timestamp queries; device frame time is not measured");
        }

        info!(
            "Frame ring created with {} frames in flight",
            frames_in_flight
        );

        Ok(Self {
            backend,
            slots,
            frame_number: 0,
            fence_timeout,
            last_wait: Duration::ZERO,
            timestamps,
            last_device_time: None,
        })
    }

    /// Claim the next slot for recording.
    ///
    /// Blocks until the device has finished the slot's previous submission,
    /// then flushes the slot's deletion queue, reclaims its binding pools,
    /// and begins its recording context.
    ///
    /// # Errors
    ///
    /// A wait that outlives the fence timeout returns [`RhiError::Timeout`].
    /// The device is then presumed lost and the ring must not be used again.
    pub fn acquire_next(&mut self) -> RhiResult<Frame<'_, B>> {
        let slot_index = (self.frame_number % self.slots.len() as u64) as usize;
        let frame_number = self.frame_number;
        let backend = &self.backend;
        let slot = &mut self.slots[slot_index];

        self.last_wait = Duration::ZERO;
        match slot.state {
            SlotState::Submitted => {
                let started = Instant::now();
                if let Err(e) = backend.wait_for_fence(&slot.idle, self.fence_timeout) {
                    error!(
                        "Frame slot {} did not complete within {:?}: {}",
                        slot_index, self.fence_timeout, e
                    );
                    return Err(e);
                }
                self.last_wait = started.elapsed();
            }
            SlotState::Recording => {
                warn!(
                    "Frame slot {} was abandoned before submit; reusing it",
                    slot_index
                );
            }
            SlotState::Idle => {}
        }
        slot.state = SlotState::Idle;

        let mut device_time = None;
        if slot.timed {
            slot.timed = false;
            if let Some(pool) = &self.timestamps {
                device_time = backend.read_timestamps(pool, query_base(slot_index))?;
            }
            if device_time.is_some() {
                self.last_device_time = device_time;
            }
        }

        if slot.acquire_pending || slot.present_pending {
            // Nothing can unsignal them, so replace them once the device is idle
            backend.wait_idle()?;
            if slot.acquire_pending {
                slot.acquired = backend.create_semaphore()?;
                slot.acquire_pending = false;
                debug!("Replaced image-acquired signal of frame slot {}", slot_index);
            }
            if slot.present_pending {
                slot.rendered = backend.create_semaphore()?;
                slot.present_pending = false;
                debug!(
                    "Replaced render-finished signal of frame slot {}; its image was never presented",
                    slot_index
                );
            }
        }

        slot.deletion_queue.flush();
        slot.bindings.reclaim_all()?;
        backend.begin_commands(&mut slot.commands)?;
        if let Some(pool) = &self.timestamps {
            backend.begin_timestamps(&mut slot.commands, pool, query_base(slot_index))?;
        }
        slot.state = SlotState::Recording;

        self.frame_number += 1;

        Ok(Frame {
            backend,
            slot,
            slot_index,
            frame_number,
            image: None,
            waited: self.last_wait,
            timestamps: self.timestamps.as_ref(),
            device_time,
        })
    }

    /// Queue a recorded frame; same as [`Frame::submit`].
    pub fn submit(frame: Frame<'_, B>) -> RhiResult<SubmittedFrame<'_, B>> {
        frame.submit()
    }

    /// Block until every submitted slot has completed, then flush each
    /// slot's deletion queue and reclaim its binding pools.
    pub fn drain(&mut self) -> RhiResult<()> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Submitted {
                if let Err(e) = self.backend.wait_for_fence(&slot.idle, self.fence_timeout) {
                    error!("Frame slot {} did not drain: {}", i, e);
                    return Err(e);
                }
            }
            slot.state = SlotState::Idle;
            slot.deletion_queue.flush();
            slot.bindings.reclaim_all()?;
        }
        debug!("Frame ring drained");
        Ok(())
    }

    /// Number of slots.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Frames handed out so far.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Host time spent blocked in the most recent [`acquire_next`](Self::acquire_next).
    #[inline]
    pub fn last_wait(&self) -> Duration {
        self.last_wait
    }

    /// Most recent device frame time read back, if any.
    #[inline]
    pub fn last_device_time(&self) -> Option<Duration> {
        self.last_device_time
    }

    /// Whether frames are bracketed with timestamp queries.
    #[inline]
    pub fn measures_device_time(&self) -> bool {
        self.timestamps.is_some()
    }

    #[inline]
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Binding-table allocator of `slot`, for inspection between frames.
    #[inline]
    pub fn slot_bindings(&self, slot: usize) -> Option<&BindingTableAllocator<B>> {
        self.slots.get(slot).map(|s| &s.bindings)
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Flush every slot queue and release every slot pool.
    ///
    /// The caller must have drained the device first.
    pub(crate) fn release_slots(&mut self) {
        for slot in &mut self.slots {
            slot.deletion_queue.flush();
            slot.bindings.destroy_all();
            slot.state = SlotState::Idle;
        }
    }
}

impl<B: GpuBackend> Drop for FrameRing<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            error!("Device wait failed during frame ring teardown: {}", e);
        }
        self.release_slots();
        debug!("Frame ring destroyed");
    }
}

/// Exclusive access to one recording slot.
///
/// Dropping a `Frame` without submitting it aborts the frame: nothing is
/// queued and the slot is reused on its next turn.
pub struct Frame<'a, B: GpuBackend> {
    backend: &'a B,
    slot: &'a mut FrameSlot<B>,
    slot_index: usize,
    frame_number: u64,
    image: Option<u32>,
    waited: Duration,
    timestamps: Option<&'a B::TimestampPool>,
    device_time: Option<Duration>,
}

impl<'a, B: GpuBackend> Frame<'a, B> {
    /// Index of the slot in the ring.
    #[inline]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// Sequence number of this frame since the ring was created.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Presentable image acquired for this frame, if any.
    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.image
    }

    /// Host time spent waiting for the slot to come free.
    #[inline]
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Device time of the previous frame recorded in this slot, when the
    /// backend measures it and the result was available.
    #[inline]
    pub fn device_time(&self) -> Option<Duration> {
        self.device_time
    }

    /// Record into the slot's command context.
    pub fn record<R>(&mut self, record: impl FnOnce(&mut B::CommandContext) -> R) -> R {
        record(&mut self.slot.commands)
    }

    #[inline]
    pub fn commands(&mut self) -> &mut B::CommandContext {
        &mut self.slot.commands
    }

    /// Binding tables valid until this slot comes round again.
    #[inline]
    pub fn binding_pool(&mut self) -> &mut BindingTableAllocator<B> {
        &mut self.slot.bindings
    }

    /// Teardown that must wait until the device has finished this frame.
    #[inline]
    pub fn deletion_queue(&mut self) -> &mut DeletionQueue {
        &mut self.slot.deletion_queue
    }

    /// Deliberately give up the frame without queuing anything.
    pub fn cancel(self) {
        self.slot.state = SlotState::Idle;
        debug!("Frame {} cancelled", self.frame_number);
    }

    /// Close recording and queue the frame. Does not block on the device.
    ///
    /// When an image was acquired, the device waits on `acquired` before
    /// running the frame and raises `rendered` when done. The slot's `idle`
    /// signal is reset here, just before the submission that raises it.
    ///
    /// A frame holding an image should be presented. If its
    /// [`SubmittedFrame`] is dropped instead, `rendered` stays signalled and
    /// the slot replaces it on its next turn.
    ///
    /// # Errors
    ///
    /// Backend failures abort the frame; the slot is reused on its next turn
    /// as if the frame had never been recorded.
    pub fn submit(self) -> RhiResult<SubmittedFrame<'a, B>> {
        let Frame {
            backend,
            slot,
            slot_index,
            frame_number,
            image,
            timestamps,
            ..
        } = self;

        if let Some(pool) = timestamps {
            backend.end_timestamps(&mut slot.commands, pool, query_base(slot_index))?;
        }
        backend.end_commands(&mut slot.commands)?;
        backend.reset_fence(&slot.idle)?;

        let sync = if image.is_some() {
            SubmitSync {
                wait: Some((&slot.acquired, vk::PipelineStageFlags::ALL_COMMANDS)),
                signal: Some(&slot.rendered),
            }
        } else {
            SubmitSync::none()
        };
        backend.submit(&slot.commands, sync, &slot.idle)?;

        slot.state = SlotState::Submitted;
        slot.timed = timestamps.is_some();
        if image.is_some() {
            slot.acquire_pending = false;
            slot.present_pending = true;
        }

        let FrameSlot {
            rendered,
            present_pending,
            ..
        } = slot;
        Ok(SubmittedFrame {
            rendered,
            present_pending,
            slot_index,
            frame_number,
            image,
        })
    }
}

impl<B: PresentBackend> Frame<'_, B> {
    /// Acquire a presentable image for this frame.
    ///
    /// On [`ImageAcquire::Ready`] the slot's `acquired` signal will fire once
    /// the image can be rendered into, and [`submit`](Self::submit) wires the
    /// frame between `acquired` and `rendered`.
    pub fn acquire_image(&mut self, presentation: &PresentationSet<B>) -> RhiResult<ImageAcquire> {
        if self.image.is_some() {
            return Err(RhiError::ContractViolation(format!(
                "frame {} already holds an image",
                self.frame_number
            )));
        }
        let acquire = presentation.acquire_image(&self.slot.acquired)?;
        if let ImageAcquire::Ready { index, .. } = acquire {
            self.image = Some(index);
            self.slot.acquire_pending = true;
        }
        Ok(acquire)
    }
}

impl<B: GpuBackend> std::fmt::Debug for Frame<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("slot_index", &self.slot_index)
            .field("frame_number", &self.frame_number)
            .field("image", &self.image)
            .finish()
    }
}

/// A queued frame, kept only to present its image.
pub struct SubmittedFrame<'a, B: GpuBackend> {
    rendered: &'a B::Semaphore,
    present_pending: &'a mut bool,
    slot_index: usize,
    frame_number: u64,
    image: Option<u32>,
}

impl<B: GpuBackend> SubmittedFrame<'_, B> {
    #[inline]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.image
    }
}

impl<B: PresentBackend> SubmittedFrame<'_, B> {
    /// Present the frame's image once rendering has finished.
    ///
    /// A stale present still waits on `rendered`, so either status leaves
    /// the slot's signals balanced. On error the slot replaces `rendered` on
    /// its next turn.
    ///
    /// # Errors
    ///
    /// Presenting a frame that never acquired an image is a
    /// [`RhiError::ContractViolation`].
    pub fn present(self, presentation: &PresentationSet<B>) -> RhiResult<PresentStatus> {
        let SubmittedFrame {
            rendered,
            present_pending,
            frame_number,
            image,
            ..
        } = self;
        let Some(index) = image else {
            return Err(RhiError::ContractViolation(format!(
                "frame {} has no image to present",
                frame_number
            )));
        };
        let status = presentation.present(index, rendered)?;
        *present_pending = false;
        Ok(status)
    }
}
