//! Immediate submission channel.
//!
//! One-off device work the host must see finished before it continues:
//! uploads during asset loading, image layout setup, and the like. The
//! channel owns its own recording context and completion signal, disjoint
//! from every frame slot, so it can run while frames are in flight.
//!
//! [`ImmediateChannel::run`] takes `&mut self`; overlapping runs are ruled
//! out by the borrow checker.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vkpipe_rhi::null::NullDevice;
//! use vkpipe_renderer::ImmediateChannel;
//!
//! # fn main() -> vkpipe_rhi::RhiResult<()> {
//! let device = Arc::new(NullDevice::new());
//! let mut immediate = ImmediateChannel::new(device, Duration::from_secs(1))?;
//!
//! let recorded = immediate.run(|commands| {
//!     commands.push("copy staging -> mesh")?;
//!     Ok(1)
//! })?;
//! assert_eq!(recorded, 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use vkpipe_rhi::{GpuBackend, RhiResult, SubmitSync};

/// Synchronous path for one-off device work.
pub struct ImmediateChannel<B: GpuBackend> {
    backend: Arc<B>,
    commands: B::CommandContext,
    done: B::Fence,
    timeout: Duration,
    runs: u64,
    last_wait: Duration,
}

impl<B: GpuBackend> ImmediateChannel<B> {
    pub fn new(backend: Arc<B>, timeout: Duration) -> RhiResult<Self> {
        let commands = backend.create_command_context()?;
        let done = backend.create_fence(true)?;
        Ok(Self {
            backend,
            commands,
            done,
            timeout,
            runs: 0,
            last_wait: Duration::ZERO,
        })
    }

    /// Record with `record`, submit, and block until the device has
    /// finished the work.
    ///
    /// # Errors
    ///
    /// An error from `record` abandons the work before anything is queued.
    /// A wait that outlives the channel timeout returns
    /// [`vkpipe_rhi::RhiError::Timeout`] and leaves the channel unusable;
    /// the device is presumed lost.
    pub fn run<R>(
        &mut self,
        record: impl FnOnce(&mut B::CommandContext) -> RhiResult<R>,
    ) -> RhiResult<R> {
        self.backend.begin_commands(&mut self.commands)?;
        let value = record(&mut self.commands)?;
        self.backend.end_commands(&mut self.commands)?;

        self.backend.reset_fence(&self.done)?;
        self.backend
            .submit(&self.commands, SubmitSync::none(), &self.done)?;

        let started = Instant::now();
        if let Err(e) = self.backend.wait_for_fence(&self.done, self.timeout) {
            error!("Immediate submission did not complete: {}", e);
            return Err(e);
        }
        self.last_wait = started.elapsed();
        self.runs += 1;
        trace!(
            "Immediate submission {} finished after {:?}",
            self.runs, self.last_wait
        );

        Ok(value)
    }

    /// Completed runs.
    #[inline]
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Host time blocked in the most recent run.
    #[inline]
    pub fn last_wait(&self) -> Duration {
        self.last_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkpipe_rhi::RhiError;
    use vkpipe_rhi::null::{CompletionMode, DeviceEvent, NullDevice};

    #[test]
    fn test_run_submits_once() {
        let device = Arc::new(NullDevice::new());
        let mut channel = ImmediateChannel::new(Arc::clone(&device), Duration::from_secs(1)).unwrap();

        channel.run(|c| c.push("upload")).unwrap();
        channel.run(|c| c.push("upload")).unwrap();

        assert_eq!(channel.runs(), 2);
        assert_eq!(device.submitted(), 2);
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn test_record_error_submits_nothing() {
        let device = Arc::new(NullDevice::new());
        let mut channel = ImmediateChannel::new(Arc::clone(&device), Duration::from_secs(1)).unwrap();

        let result: RhiResult<()> =
            channel.run(|_| Err(RhiError::InvalidHandle("missing staging buffer".into())));
        assert!(result.is_err());
        assert_eq!(device.submitted(), 0);

        // The channel recovers on the next run
        channel.run(|c| c.push("retry")).unwrap();
        assert_eq!(device.submitted(), 1);
    }

    #[test]
    fn test_run_waits_for_completion() {
        let device = Arc::new(NullDevice::with_mode(CompletionMode::Delayed(
            Duration::from_millis(30),
        )));
        let mut channel = ImmediateChannel::new(Arc::clone(&device), Duration::from_secs(2)).unwrap();

        channel.run(|c| c.push("transition")).unwrap();

        let events = device.events();
        assert!(events.contains(&DeviceEvent::Completed { submission: 1 }));
        assert!(channel.last_wait() > Duration::ZERO);
    }

    #[test]
    fn test_timeout_is_fatal() {
        let device = Arc::new(NullDevice::with_mode(CompletionMode::Manual));
        let mut channel =
            ImmediateChannel::new(Arc::clone(&device), Duration::from_millis(20)).unwrap();

        let err = channel.run(|c| c.push("never completes")).unwrap_err();
        assert!(err.is_device_loss());
        device.complete_all();
    }
}
