//! Headless backend running on a software timeline.
//!
//! [`NullDevice`] implements [`GpuBackend`] and [`PresentBackend`] without a
//! GPU. Submissions join a queue and complete according to a
//! [`CompletionMode`], which lets callers control exactly when the host
//! observes completion:
//!
//! - [`CompletionMode::Immediate`] completes every submission as it is made.
//! - [`CompletionMode::Manual`] leaves submissions pending until
//!   [`NullDevice::complete_next`], [`NullDevice::complete_through`] or
//!   [`NullDevice::complete_all`] is called, typically from another thread.
//! - [`CompletionMode::Delayed`] completes each submission after a fixed
//!   delay on a timer thread.
//!
//! The device enforces the usage rules a real driver validates: fences must be
//! unsignalled when submitted and idle when reset, binary semaphores must
//! alternate between one signal and one wait, and recording contexts must be
//! closed before submission. Violations surface as
//! [`RhiError::ContractViolation`].
//!
//! Timestamp pairs report the time between a submission and its completion,
//! so a [`CompletionMode::Delayed`] device times every frame at its delay.
//!
//! Binding pools track tables and descriptors per type exactly as their
//! [`PoolSizeRatio`]s dictate, and presentation chains go stale when
//! [`NullDevice::set_surface_extent`] moves the live surface away from them.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use vkpipe_rhi::backend::{GpuBackend, SubmitSync};
//! use vkpipe_rhi::null::{CompletionMode, NullDevice};
//!
//! # fn main() -> vkpipe_rhi::RhiResult<()> {
//! let device = NullDevice::with_mode(CompletionMode::Manual);
//! let fence = device.create_fence(false)?;
//! let mut commands = device.create_command_context()?;
//! device.begin_commands(&mut commands)?;
//! device.end_commands(&mut commands)?;
//! device.submit(&commands, SubmitSync::none(), &fence)?;
//!
//! assert!(!device.is_signaled(&fence));
//! device.complete_next();
//! device.wait_for_fence(&fence, Duration::from_millis(10))?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::backend::{
    GpuBackend, ImageAcquire, PoolSizeRatio, PresentBackend, PresentStatus, SubmitSync,
};
use crate::error::{RhiError, RhiResult};

/// When the software timeline completes submitted work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    Immediate,
    Manual,
    Delayed(Duration),
}

/// Something that happened on the software timeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Submitted {
        submission: u64,
        context: u64,
        wait: Option<u64>,
        signal: Option<u64>,
        fence: u64,
    },
    Completed {
        submission: u64,
    },
    PoolCreated {
        pool: u64,
        max_tables: u32,
    },
    PoolReset {
        pool: u64,
    },
    SwapchainCreated {
        swapchain: u64,
        extent: vk::Extent2D,
        image_count: u32,
    },
    Acquired {
        swapchain: u64,
        index: u32,
        signal: u64,
    },
    Presented {
        swapchain: u64,
        index: u32,
        wait: u64,
    },
    Stale {
        swapchain: u64,
    },
}

/// Completion signal of the software timeline.
#[derive(Debug)]
pub struct NullFence {
    id: u64,
}

impl NullFence {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ordering signal of the software timeline.
#[derive(Debug)]
pub struct NullSemaphore {
    id: u64,
}

impl NullSemaphore {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

/// Timestamp pair opened in a recording context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TimedSpan {
    pool: u64,
    first: u32,
    closed: bool,
}

/// Recording context holding labelled commands.
#[derive(Debug)]
pub struct NullCommandContext {
    id: u64,
    state: RecordState,
    commands: Vec<String>,
    timing: Option<TimedSpan>,
}

impl NullCommandContext {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record a labelled command. Only valid between begin and end.
    pub fn push(&mut self, label: impl Into<String>) -> RhiResult<()> {
        if self.state != RecordState::Recording {
            return Err(RhiError::ContractViolation(format!(
                "command recorded into context {} outside of recording",
                self.id
            )));
        }
        self.commands.push(label.into());
        Ok(())
    }

    /// Commands recorded since the last begin.
    #[inline]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

/// Descriptor needs of a binding table, per type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NullLayout {
    needs: Vec<(vk::DescriptorType, u32)>,
}

impl NullLayout {
    pub fn new(needs: &[(vk::DescriptorType, u32)]) -> Self {
        Self {
            needs: needs.to_vec(),
        }
    }

    /// Layout with a single descriptor of `ty`.
    pub fn single(ty: vk::DescriptorType) -> Self {
        Self::new(&[(ty, 1)])
    }
}

/// Binding table handed out by a [`NullBindingPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NullTable {
    pub pool: u64,
    pub index: u32,
}

/// Fixed-capacity pool tracking tables and descriptors per type.
#[derive(Debug)]
pub struct NullBindingPool {
    id: u64,
    max_tables: u32,
    tables: u32,
    capacity: Vec<(vk::DescriptorType, u32)>,
    used: HashMap<vk::DescriptorType, u32>,
}

impl NullBindingPool {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn max_tables(&self) -> u32 {
        self.max_tables
    }

    /// Tables allocated since the last reset.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.tables
    }

    fn capacity_of(&self, ty: vk::DescriptorType) -> u32 {
        self.capacity
            .iter()
            .filter(|(t, _)| *t == ty)
            .map(|(_, n)| n)
            .sum()
    }
}

/// Timestamp queries of the software timeline.
#[derive(Debug)]
pub struct NullTimestampPool {
    id: u64,
    count: u32,
}

impl NullTimestampPool {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    fn check_pair(&self, first: u32) -> RhiResult<()> {
        if first + 1 >= self.count {
            return Err(RhiError::ContractViolation(format!(
                "timestamp pair {} outside a pool of {}",
                first, self.count
            )));
        }
        Ok(())
    }
}

/// Presentation chain of the software timeline.
#[derive(Debug)]
pub struct NullSwapchain {
    id: u64,
    extent: vk::Extent2D,
    image_count: u32,
    next_image: AtomicU32,
}

impl NullSwapchain {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct Pending {
    submission: u64,
    fence: u64,
    /// Timestamp pair `(pool, first)` written by this submission, and when it was queued.
    timing: Option<(u64, u32, Instant)>,
}

#[derive(Debug)]
struct Timeline {
    next_id: u64,
    submitted: u64,
    completed: u64,
    pending: VecDeque<Pending>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    pools_created: u64,
    /// Host threads blocked in `wait_for_fence`.
    fence_waiters: usize,
    timestamps: HashMap<(u64, u32), Duration>,
    timestamps_supported: bool,
    surface_extent: Option<vk::Extent2D>,
    fail_next_submit: Option<vk::Result>,
    log_events: bool,
    events: Vec<DeviceEvent>,
}

impl Timeline {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn log(&mut self, event: DeviceEvent) {
        if self.log_events {
            self.events.push(event);
        }
    }

    fn fence_signaled(&self, id: u64) -> bool {
        self.fences.get(&id).copied().unwrap_or(false)
    }

    fn complete_one(&mut self) -> bool {
        let Some(done) = self.pending.pop_front() else {
            return false;
        };
        self.fences.insert(done.fence, true);
        if let Some((pool, first, queued)) = done.timing {
            self.timestamps.insert((pool, first), queued.elapsed());
        }
        self.completed = done.submission;
        self.log(DeviceEvent::Completed {
            submission: done.submission,
        });
        trace!("Null device completed submission {}", done.submission);
        true
    }

    fn signal_semaphore(&mut self, id: u64) -> RhiResult<()> {
        let signaled = self.semaphores.entry(id).or_insert(false);
        if *signaled {
            return Err(RhiError::ContractViolation(format!(
                "semaphore {id} signalled again before anything waited on it"
            )));
        }
        *signaled = true;
        Ok(())
    }

    fn consume_semaphore(&mut self, id: u64) -> RhiResult<()> {
        let signaled = self.semaphores.entry(id).or_insert(false);
        if !*signaled {
            return Err(RhiError::ContractViolation(format!(
                "wait on semaphore {id} that has no pending signal"
            )));
        }
        *signaled = false;
        Ok(())
    }
}

struct Shared {
    mode: CompletionMode,
    state: Mutex<Timeline>,
    progress: Condvar,
}

/// Headless device on a software timeline.
pub struct NullDevice {
    shared: Arc<Shared>,
}

impl NullDevice {
    /// Device completing every submission immediately.
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Immediate)
    }

    pub fn with_mode(mode: CompletionMode) -> Self {
        debug!("Created null device ({:?} completion)", mode);
        Self {
            shared: Arc::new(Shared {
                mode,
                state: Mutex::new(Timeline {
                    next_id: 0,
                    submitted: 0,
                    completed: 0,
                    pending: VecDeque::new(),
                    fences: HashMap::new(),
                    semaphores: HashMap::new(),
                    pools_created: 0,
                    fence_waiters: 0,
                    timestamps: HashMap::new(),
                    timestamps_supported: true,
                    surface_extent: None,
                    fail_next_submit: None,
                    log_events: true,
                    events: Vec::new(),
                }),
                progress: Condvar::new(),
            }),
        }
    }

    #[inline]
    pub fn mode(&self) -> CompletionMode {
        self.shared.mode
    }

    /// Complete the oldest pending submission. Returns false if none is pending.
    pub fn complete_next(&self) -> bool {
        let done = self.shared.state.lock().complete_one();
        self.shared.progress.notify_all();
        done
    }

    /// Complete every pending submission numbered `submission` or lower.
    pub fn complete_through(&self, submission: u64) {
        let mut state = self.shared.state.lock();
        while state
            .pending
            .front()
            .is_some_and(|p| p.submission <= submission)
        {
            state.complete_one();
        }
        drop(state);
        self.shared.progress.notify_all();
    }

    pub fn complete_all(&self) {
        let mut state = self.shared.state.lock();
        while state.complete_one() {}
        drop(state);
        self.shared.progress.notify_all();
    }

    /// Block until at least `count` submissions were made, or `timeout` expires.
    pub fn wait_for_submissions(&self, count: u64, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        self.shared
            .progress
            .wait_while_for(&mut state, |s| s.submitted < count, timeout);
        state.submitted >= count
    }

    /// Block until some host thread is waiting on an unsignalled fence, or
    /// `timeout` expires.
    pub fn wait_for_fence_waiter(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        self.shared
            .progress
            .wait_while_for(&mut state, |s| s.fence_waiters == 0, timeout);
        state.fence_waiters > 0
    }

    /// Number of submissions made so far; submissions are numbered from 1.
    pub fn submitted(&self) -> u64 {
        self.shared.state.lock().submitted
    }

    /// Number of the most recently completed submission, 0 if none.
    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn pools_created(&self) -> u64 {
        self.shared.state.lock().pools_created
    }

    pub fn is_signaled(&self, fence: &NullFence) -> bool {
        self.shared.state.lock().fence_signaled(fence.id)
    }

    /// Move the live surface. Chains built for another extent go stale, and
    /// chains created afterwards take this extent.
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.shared.state.lock().surface_extent = Some(extent);
    }

    /// Whether timestamp pools can be created; on by default.
    pub fn set_timestamps_supported(&self, supported: bool) {
        self.shared.state.lock().timestamps_supported = supported;
    }

    /// Make the next submission fail with `result` before it is queued.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.shared.state.lock().fail_next_submit = Some(result);
    }

    pub fn set_event_logging(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        state.log_events = enabled;
        if !enabled {
            state.events.clear();
        }
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Drain the event log.
    pub fn take_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.shared.state.lock().events)
    }

    fn schedule_delayed(&self, submission: u64, delay: Duration) {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let mut state = shared.state.lock();
            // Completion stays in submission order even if timers race
            while state
                .pending
                .front()
                .is_some_and(|p| p.submission <= submission)
            {
                state.complete_one();
            }
            drop(state);
            shared.progress.notify_all();
        });
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NullDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("NullDevice")
            .field("mode", &self.shared.mode)
            .field("submitted", &state.submitted)
            .field("completed", &state.completed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl GpuBackend for NullDevice {
    type Fence = NullFence;
    type Semaphore = NullSemaphore;
    type CommandContext = NullCommandContext;
    type BindingPool = NullBindingPool;
    type BindingLayout = NullLayout;
    type BindingTable = NullTable;
    type TimestampPool = NullTimestampPool;

    fn create_fence(&self, signaled: bool) -> RhiResult<NullFence> {
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        state.fences.insert(id, signaled);
        Ok(NullFence { id })
    }

    fn wait_for_fence(&self, fence: &NullFence, timeout: Duration) -> RhiResult<()> {
        let started = Instant::now();
        let mut state = self.shared.state.lock();
        if !state.fence_signaled(fence.id) {
            state.fence_waiters += 1;
            self.shared.progress.notify_all();
            self.shared
                .progress
                .wait_while_for(&mut state, |s| !s.fence_signaled(fence.id), timeout);
            state.fence_waiters -= 1;
        }
        if state.fence_signaled(fence.id) {
            Ok(())
        } else {
            Err(RhiError::Timeout {
                what: "fence",
                waited: started.elapsed(),
            })
        }
    }

    fn reset_fence(&self, fence: &NullFence) -> RhiResult<()> {
        let mut state = self.shared.state.lock();
        if state.pending.iter().any(|p| p.fence == fence.id) {
            return Err(RhiError::ContractViolation(format!(
                "fence {} reset while its submission is still pending",
                fence.id
            )));
        }
        state.fences.insert(fence.id, false);
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<NullSemaphore> {
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        state.semaphores.insert(id, false);
        Ok(NullSemaphore { id })
    }

    fn create_command_context(&self) -> RhiResult<NullCommandContext> {
        let id = self.shared.state.lock().next_id();
        Ok(NullCommandContext {
            id,
            state: RecordState::Initial,
            commands: Vec::new(),
            timing: None,
        })
    }

    fn begin_commands(&self, commands: &mut NullCommandContext) -> RhiResult<()> {
        commands.commands.clear();
        commands.timing = None;
        commands.state = RecordState::Recording;
        Ok(())
    }

    fn end_commands(&self, commands: &mut NullCommandContext) -> RhiResult<()> {
        if commands.state != RecordState::Recording {
            return Err(RhiError::ContractViolation(format!(
                "context {} ended without being begun",
                commands.id
            )));
        }
        commands.state = RecordState::Executable;
        Ok(())
    }

    fn submit(
        &self,
        commands: &NullCommandContext,
        sync: SubmitSync<'_, NullSemaphore>,
        fence: &NullFence,
    ) -> RhiResult<()> {
        let mut state = self.shared.state.lock();
        if let Some(result) = state.fail_next_submit.take() {
            return Err(RhiError::from(result));
        }
        if commands.state != RecordState::Executable {
            return Err(RhiError::ContractViolation(format!(
                "context {} submitted while not executable",
                commands.id
            )));
        }
        if state.fence_signaled(fence.id) {
            return Err(RhiError::ContractViolation(format!(
                "fence {} submitted while already signalled",
                fence.id
            )));
        }
        if let Some((wait, _)) = sync.wait {
            state.consume_semaphore(wait.id)?;
        }
        if let Some(signal) = sync.signal {
            state.signal_semaphore(signal.id)?;
        }

        let timing = match commands.timing {
            Some(span) if span.closed => {
                // The recorded reset takes effect when the work is queued
                state.timestamps.remove(&(span.pool, span.first));
                Some((span.pool, span.first, Instant::now()))
            }
            _ => None,
        };

        state.submitted += 1;
        let submission = state.submitted;
        state.pending.push_back(Pending {
            submission,
            fence: fence.id,
            timing,
        });
        state.log(DeviceEvent::Submitted {
            submission,
            context: commands.id,
            wait: sync.wait.map(|(s, _)| s.id),
            signal: sync.signal.map(|s| s.id),
            fence: fence.id,
        });
        trace!(
            "Null device queued submission {} ({} commands)",
            submission,
            commands.commands.len()
        );

        match self.shared.mode {
            CompletionMode::Immediate => {
                state.complete_one();
            }
            CompletionMode::Manual => {}
            CompletionMode::Delayed(delay) => {
                drop(state);
                self.schedule_delayed(submission, delay);
                self.shared.progress.notify_all();
                return Ok(());
            }
        }
        drop(state);
        self.shared.progress.notify_all();
        Ok(())
    }

    fn create_binding_pool(
        &self,
        max_tables: u32,
        ratios: &[PoolSizeRatio],
    ) -> RhiResult<NullBindingPool> {
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        state.pools_created += 1;
        state.log(DeviceEvent::PoolCreated {
            pool: id,
            max_tables,
        });
        Ok(NullBindingPool {
            id,
            max_tables,
            tables: 0,
            capacity: ratios
                .iter()
                .map(|r| (r.ty, r.descriptor_count(max_tables)))
                .collect(),
            used: HashMap::new(),
        })
    }

    fn allocate_binding_table(
        &self,
        pool: &mut NullBindingPool,
        layout: &NullLayout,
    ) -> RhiResult<NullTable> {
        if pool.tables >= pool.max_tables {
            return Err(RhiError::PoolExhausted);
        }
        for &(ty, count) in &layout.needs {
            let used = pool.used.get(&ty).copied().unwrap_or(0);
            if used + count > pool.capacity_of(ty) {
                return Err(RhiError::PoolExhausted);
            }
        }
        for &(ty, count) in &layout.needs {
            *pool.used.entry(ty).or_insert(0) += count;
        }
        let table = NullTable {
            pool: pool.id,
            index: pool.tables,
        };
        pool.tables += 1;
        Ok(table)
    }

    fn reset_binding_pool(&self, pool: &mut NullBindingPool) -> RhiResult<()> {
        pool.tables = 0;
        pool.used.clear();
        self.shared
            .state
            .lock()
            .log(DeviceEvent::PoolReset { pool: pool.id });
        Ok(())
    }

    fn create_timestamp_pool(&self, count: u32) -> RhiResult<Option<NullTimestampPool>> {
        let mut state = self.shared.state.lock();
        if !state.timestamps_supported {
            return Ok(None);
        }
        let id = state.next_id();
        Ok(Some(NullTimestampPool { id, count }))
    }

    fn begin_timestamps(
        &self,
        commands: &mut NullCommandContext,
        pool: &NullTimestampPool,
        first: u32,
    ) -> RhiResult<()> {
        pool.check_pair(first)?;
        if commands.state != RecordState::Recording {
            return Err(RhiError::ContractViolation(format!(
                "timestamps begun in context {} outside of recording",
                commands.id
            )));
        }
        commands.timing = Some(TimedSpan {
            pool: pool.id,
            first,
            closed: false,
        });
        Ok(())
    }

    fn end_timestamps(
        &self,
        commands: &mut NullCommandContext,
        pool: &NullTimestampPool,
        first: u32,
    ) -> RhiResult<()> {
        pool.check_pair(first)?;
        match &mut commands.timing {
            Some(span) if span.pool == pool.id && span.first == first && !span.closed => {
                span.closed = true;
                Ok(())
            }
            _ => Err(RhiError::ContractViolation(format!(
                "timestamp pair {} ended in context {} without being begun",
                first, commands.id
            ))),
        }
    }

    fn read_timestamps(
        &self,
        pool: &NullTimestampPool,
        first: u32,
    ) -> RhiResult<Option<Duration>> {
        pool.check_pair(first)?;
        Ok(self
            .shared
            .state
            .lock()
            .timestamps
            .get(&(pool.id, first))
            .copied())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        match self.shared.mode {
            // Nothing else would ever complete the work, so draining means finishing it
            CompletionMode::Immediate | CompletionMode::Manual => {
                self.complete_all();
                Ok(())
            }
            CompletionMode::Delayed(delay) => {
                let started = Instant::now();
                let bound = delay * 4 + Duration::from_secs(1);
                let mut state = self.shared.state.lock();
                self.shared
                    .progress
                    .wait_while_for(&mut state, |s| !s.pending.is_empty(), bound);
                if state.pending.is_empty() {
                    Ok(())
                } else {
                    Err(RhiError::Timeout {
                        what: "device idle",
                        waited: started.elapsed(),
                    })
                }
            }
        }
    }
}

impl PresentBackend for NullDevice {
    type Swapchain = NullSwapchain;

    fn create_swapchain(&self, extent: vk::Extent2D, image_count: u32) -> RhiResult<NullSwapchain> {
        let mut state = self.shared.state.lock();
        let extent = state.surface_extent.unwrap_or(extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapchainError(format!(
                "cannot build a chain for a {}x{} surface",
                extent.width, extent.height
            )));
        }
        let id = state.next_id();
        let image_count = image_count.max(1);
        state.log(DeviceEvent::SwapchainCreated {
            swapchain: id,
            extent,
            image_count,
        });
        debug!(
            "Null swapchain {} created: {}x{}, {} images",
            id, extent.width, extent.height, image_count
        );
        Ok(NullSwapchain {
            id,
            extent,
            image_count,
            next_image: AtomicU32::new(0),
        })
    }

    fn swapchain_extent(&self, chain: &NullSwapchain) -> vk::Extent2D {
        chain.extent
    }

    fn swapchain_image_count(&self, chain: &NullSwapchain) -> u32 {
        chain.image_count
    }

    fn acquire_image(
        &self,
        chain: &NullSwapchain,
        signal: &NullSemaphore,
        _timeout: Duration,
    ) -> RhiResult<ImageAcquire> {
        let mut state = self.shared.state.lock();
        if state.surface_extent.is_some_and(|e| e != chain.extent) {
            state.log(DeviceEvent::Stale {
                swapchain: chain.id,
            });
            return Ok(ImageAcquire::Stale);
        }
        state.signal_semaphore(signal.id)?;
        let index = chain.next_image.fetch_add(1, Ordering::Relaxed) % chain.image_count;
        state.log(DeviceEvent::Acquired {
            swapchain: chain.id,
            index,
            signal: signal.id,
        });
        Ok(ImageAcquire::Ready {
            index,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        chain: &NullSwapchain,
        index: u32,
        wait: &NullSemaphore,
    ) -> RhiResult<PresentStatus> {
        let mut state = self.shared.state.lock();
        if index >= chain.image_count {
            return Err(RhiError::ContractViolation(format!(
                "present of image {} from a chain of {}",
                index, chain.image_count
            )));
        }
        state.consume_semaphore(wait.id)?;
        if state.surface_extent.is_some_and(|e| e != chain.extent) {
            state.log(DeviceEvent::Stale {
                swapchain: chain.id,
            });
            return Ok(PresentStatus::Stale);
        }
        state.log(DeviceEvent::Presented {
            swapchain: chain.id,
            index,
            wait: wait.id,
        });
        Ok(PresentStatus::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_empty(device: &NullDevice, fence: &NullFence) -> RhiResult<()> {
        let mut ctx = device.create_command_context()?;
        device.begin_commands(&mut ctx)?;
        device.end_commands(&mut ctx)?;
        device.submit(&ctx, SubmitSync::none(), fence)
    }

    #[test]
    fn test_immediate_mode_signals_on_submit() {
        let device = NullDevice::new();
        let fence = device.create_fence(false).unwrap();
        submit_empty(&device, &fence).unwrap();
        assert!(device.is_signaled(&fence));
        assert_eq!(device.submitted(), 1);
        assert_eq!(device.completed(), 1);
    }

    #[test]
    fn test_manual_mode_wait_times_out() {
        let device = NullDevice::with_mode(CompletionMode::Manual);
        let fence = device.create_fence(false).unwrap();
        submit_empty(&device, &fence).unwrap();

        let err = device
            .wait_for_fence(&fence, Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_device_loss());

        assert!(device.complete_next());
        device
            .wait_for_fence(&fence, Duration::from_millis(20))
            .unwrap();
        assert!(!device.complete_next());
    }

    #[test]
    fn test_complete_through_is_ordered() {
        let device = NullDevice::with_mode(CompletionMode::Manual);
        let fences: Vec<_> = (0..3).map(|_| device.create_fence(false).unwrap()).collect();
        for fence in &fences {
            submit_empty(&device, fence).unwrap();
        }
        device.complete_through(2);
        assert!(device.is_signaled(&fences[0]));
        assert!(device.is_signaled(&fences[1]));
        assert!(!device.is_signaled(&fences[2]));
        assert_eq!(device.completed(), 2);
        assert_eq!(device.pending(), 1);
    }

    #[test]
    fn test_delayed_mode_blocks_waiter() {
        let delay = Duration::from_millis(30);
        let device = NullDevice::with_mode(CompletionMode::Delayed(delay));
        let fence = device.create_fence(false).unwrap();
        let started = Instant::now();
        submit_empty(&device, &fence).unwrap();
        device
            .wait_for_fence(&fence, Duration::from_secs(1))
            .unwrap();
        assert!(started.elapsed() >= delay);
    }

    #[test]
    fn test_timestamps_report_device_delay() {
        let delay = Duration::from_millis(20);
        let device = NullDevice::with_mode(CompletionMode::Delayed(delay));
        let pool = device.create_timestamp_pool(4).unwrap().unwrap();
        let fence = device.create_fence(false).unwrap();

        let mut ctx = device.create_command_context().unwrap();
        device.begin_commands(&mut ctx).unwrap();
        device.begin_timestamps(&mut ctx, &pool, 2).unwrap();
        device.end_timestamps(&mut ctx, &pool, 2).unwrap();
        device.end_commands(&mut ctx).unwrap();
        device.submit(&ctx, SubmitSync::none(), &fence).unwrap();
        assert_eq!(device.read_timestamps(&pool, 2).unwrap(), None);

        device
            .wait_for_fence(&fence, Duration::from_secs(1))
            .unwrap();
        let elapsed = device.read_timestamps(&pool, 2).unwrap().unwrap();
        assert!(elapsed >= delay);
        assert_eq!(device.read_timestamps(&pool, 0).unwrap(), None);
    }

    #[test]
    fn test_timestamp_pair_must_fit_and_balance() {
        let device = NullDevice::new();
        let pool = device.create_timestamp_pool(2).unwrap().unwrap();
        let mut ctx = device.create_command_context().unwrap();
        assert!(device.begin_timestamps(&mut ctx, &pool, 0).is_err());

        device.begin_commands(&mut ctx).unwrap();
        assert!(device.begin_timestamps(&mut ctx, &pool, 1).is_err());
        assert!(device.end_timestamps(&mut ctx, &pool, 0).is_err());
        device.begin_timestamps(&mut ctx, &pool, 0).unwrap();
        device.end_timestamps(&mut ctx, &pool, 0).unwrap();
        assert!(device.end_timestamps(&mut ctx, &pool, 0).is_err());
    }

    #[test]
    fn test_timestamps_can_be_unsupported() {
        let device = NullDevice::new();
        device.set_timestamps_supported(false);
        assert!(device.create_timestamp_pool(4).unwrap().is_none());
    }

    #[test]
    fn test_fence_waiter_is_observable() {
        let device = Arc::new(NullDevice::with_mode(CompletionMode::Manual));
        let fence = device.create_fence(false).unwrap();
        submit_empty(&device, &fence).unwrap();
        assert!(!device.wait_for_fence_waiter(Duration::from_millis(10)));

        let waiter = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || device.wait_for_fence(&fence, Duration::from_secs(5)))
        };
        assert!(device.wait_for_fence_waiter(Duration::from_secs(5)));
        device.complete_all();
        waiter.join().unwrap().unwrap();
        assert!(!device.wait_for_fence_waiter(Duration::ZERO));
    }

    #[test]
    fn test_signalled_fence_cannot_be_submitted() {
        let device = NullDevice::new();
        let fence = device.create_fence(true).unwrap();
        let err = submit_empty(&device, &fence).unwrap_err();
        assert!(matches!(err, RhiError::ContractViolation(_)));
    }

    #[test]
    fn test_pending_fence_cannot_be_reset() {
        let device = NullDevice::with_mode(CompletionMode::Manual);
        let fence = device.create_fence(false).unwrap();
        submit_empty(&device, &fence).unwrap();
        assert!(matches!(
            device.reset_fence(&fence),
            Err(RhiError::ContractViolation(_))
        ));
        device.complete_all();
        device.reset_fence(&fence).unwrap();
        assert!(!device.is_signaled(&fence));
    }

    #[test]
    fn test_unbegun_context_rejected() {
        let device = NullDevice::new();
        let mut ctx = device.create_command_context().unwrap();
        assert!(ctx.push("draw").is_err());
        assert!(device.end_commands(&mut ctx).is_err());
        device.begin_commands(&mut ctx).unwrap();
        ctx.push("draw").unwrap();
        assert_eq!(ctx.commands(), ["draw"]);
        device.begin_commands(&mut ctx).unwrap();
        assert!(ctx.commands().is_empty());
    }

    #[test]
    fn test_injected_submit_failure() {
        let device = NullDevice::new();
        let fence = device.create_fence(false).unwrap();
        device.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(
            submit_empty(&device, &fence),
            Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
        ));
        assert_eq!(device.submitted(), 0);
        submit_empty(&device, &fence).unwrap();
    }

    #[test]
    fn test_semaphore_must_alternate() {
        let device = NullDevice::new();
        let sem = device.create_semaphore().unwrap();
        let fence = device.create_fence(false).unwrap();
        let mut ctx = device.create_command_context().unwrap();
        device.begin_commands(&mut ctx).unwrap();
        device.end_commands(&mut ctx).unwrap();

        let waits_unsignalled = SubmitSync {
            wait: Some((&sem, vk::PipelineStageFlags::ALL_COMMANDS)),
            signal: None,
        };
        assert!(matches!(
            device.submit(&ctx, waits_unsignalled, &fence),
            Err(RhiError::ContractViolation(_))
        ));

        let signals = SubmitSync {
            wait: None,
            signal: Some(&sem),
        };
        device.submit(&ctx, signals, &fence).unwrap();
        device.reset_fence(&fence).unwrap();
        assert!(matches!(
            device.submit(&ctx, signals, &fence),
            Err(RhiError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_pool_capacity_follows_ratios() {
        let device = NullDevice::new();
        let ratios = [PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)];
        let mut pool = device.create_binding_pool(4, &ratios).unwrap();
        let two = NullLayout::new(&[(vk::DescriptorType::UNIFORM_BUFFER, 2)]);

        device.allocate_binding_table(&mut pool, &two).unwrap();
        device.allocate_binding_table(&mut pool, &two).unwrap();
        assert!(matches!(
            device.allocate_binding_table(&mut pool, &two),
            Err(RhiError::PoolExhausted)
        ));

        device.reset_binding_pool(&mut pool).unwrap();
        assert_eq!(pool.allocated(), 0);
        let table = device.allocate_binding_table(&mut pool, &two).unwrap();
        assert_eq!(table, NullTable { pool: pool.id(), index: 0 });
    }

    #[test]
    fn test_pool_rejects_unlisted_type() {
        let device = NullDevice::new();
        let ratios = [PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0)];
        let mut pool = device.create_binding_pool(10, &ratios).unwrap();
        let sampler = NullLayout::single(vk::DescriptorType::SAMPLER);
        assert!(
            device
                .allocate_binding_table(&mut pool, &sampler)
                .unwrap_err()
                .is_pool_exhaustion()
        );
    }

    #[test]
    fn test_swapchain_goes_stale_on_resize() {
        let device = NullDevice::new();
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let chain = device.create_swapchain(extent, 3).unwrap();
        let sem = device.create_semaphore().unwrap();

        let acquired = device
            .acquire_image(&chain, &sem, Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            acquired,
            ImageAcquire::Ready {
                index: 0,
                suboptimal: false
            }
        );
        assert_eq!(
            device.present(&chain, 0, &sem).unwrap(),
            PresentStatus::Presented
        );

        device.set_surface_extent(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        assert_eq!(
            device
                .acquire_image(&chain, &sem, Duration::from_secs(1))
                .unwrap(),
            ImageAcquire::Stale
        );

        let rebuilt = device.create_swapchain(extent, 3).unwrap();
        assert_eq!(device.swapchain_extent(&rebuilt).width, 1024);
    }

    #[test]
    fn test_zero_extent_chain_rejected() {
        let device = NullDevice::new();
        let zero = vk::Extent2D {
            width: 0,
            height: 600,
        };
        assert!(matches!(
            device.create_swapchain(zero, 2),
            Err(RhiError::SwapchainError(_))
        ));
    }

    #[test]
    fn test_null_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NullDevice>();
    }
}
