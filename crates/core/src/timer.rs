//! Section timing and per-frame statistics.
//!
//! [`Timer`] measures one section of host work between `begin` and `end`.
//! [`FrameStats`] accumulates frame-to-frame timing, the time the host
//! spent blocked on device completion signals, and, where the device can
//! write timestamps, how long each frame took on the device.

use std::time::{Duration, Instant};

/// Smoothing factor of the rolling frame time average.
const AVERAGE_WEIGHT: f64 = 0.1;

/// Measures the duration of a section of host work.
#[derive(Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    last: Duration,
}

impl Timer {
    /// Create a timer that has not measured anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start measuring a section.
    pub fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Finish the current section and return its duration.
    ///
    /// Calling `end` without a matching `begin` leaves the previous
    /// measurement in place.
    pub fn end(&mut self) -> Duration {
        if let Some(started) = self.started.take() {
            self.last = started.elapsed();
        }
        self.last
    }

    /// Duration of the last completed section.
    #[inline]
    pub fn last(&self) -> Duration {
        self.last
    }

    /// Duration of the last completed section in milliseconds.
    #[inline]
    pub fn last_ms(&self) -> f32 {
        self.last.as_secs_f32() * 1000.0
    }
}

/// Rolling frame statistics.
#[derive(Debug, Default)]
pub struct FrameStats {
    frames: u64,
    last_tick: Option<Instant>,
    frame_time: Duration,
    average: Duration,
    blocked: Duration,
    blocked_total: Duration,
    device_frames: u64,
    device_time: Duration,
    device_average: Duration,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a new frame and return the time since the previous one.
    ///
    /// The first tick returns [`Duration::ZERO`] and does not feed the average.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = self.last_tick.map_or(Duration::ZERO, |last| now - last);
        self.last_tick = Some(now);
        self.record_frame(delta);
        delta
    }

    /// Feed one frame duration into the statistics.
    pub fn record_frame(&mut self, delta: Duration) {
        self.frames += 1;
        if delta.is_zero() && self.frames == 1 {
            return;
        }
        self.frame_time = delta;
        self.average = if self.average.is_zero() {
            delta
        } else {
            self.average.mul_f64(1.0 - AVERAGE_WEIGHT) + delta.mul_f64(AVERAGE_WEIGHT)
        };
    }

    /// Record time the host spent waiting on a completion signal.
    pub fn record_blocked(&mut self, waited: Duration) {
        self.blocked = waited;
        self.blocked_total += waited;
    }

    /// Feed the device execution time of one frame, read back from timestamps.
    pub fn record_device_time(&mut self, elapsed: Duration) {
        self.device_frames += 1;
        self.device_time = elapsed;
        self.device_average = if self.device_frames == 1 {
            elapsed
        } else {
            self.device_average.mul_f64(1.0 - AVERAGE_WEIGHT) + elapsed.mul_f64(AVERAGE_WEIGHT)
        };
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn frame_time(&self) -> Duration {
        self.frame_time
    }

    #[inline]
    pub fn average_frame_time(&self) -> Duration {
        self.average
    }

    /// Host time blocked on the most recent completion wait.
    #[inline]
    pub fn blocked(&self) -> Duration {
        self.blocked
    }

    #[inline]
    pub fn blocked_total(&self) -> Duration {
        self.blocked_total
    }

    /// Device time of the most recently timed frame; `None` until one was read back.
    pub fn device_time(&self) -> Option<Duration> {
        (self.device_frames > 0).then_some(self.device_time)
    }

    /// Rolling average of device frame time; `None` until one was read back.
    pub fn average_device_time(&self) -> Option<Duration> {
        (self.device_frames > 0).then_some(self.device_average)
    }

    /// Frames timed on the device.
    #[inline]
    pub fn device_frames(&self) -> u64 {
        self.device_frames
    }

    /// Frames per second derived from the rolling average, 0 before any frame.
    pub fn fps(&self) -> f32 {
        if self.average.is_zero() {
            0.0
        } else {
            1.0 / self.average.as_secs_f32()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures_section() {
        let mut timer = Timer::new();
        timer.begin();
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.end();
        assert!(elapsed >= Duration::from_millis(5));
        assert_eq!(timer.last(), elapsed);
        assert!(timer.last_ms() >= 5.0);
    }

    #[test]
    fn test_timer_end_without_begin_keeps_last() {
        let mut timer = Timer::new();
        assert_eq!(timer.end(), Duration::ZERO);
    }

    #[test]
    fn test_frame_stats_first_tick_is_zero() {
        let mut stats = FrameStats::new();
        assert_eq!(stats.tick(), Duration::ZERO);
        assert_eq!(stats.frames(), 1);
        assert_eq!(stats.average_frame_time(), Duration::ZERO);
        assert_eq!(stats.fps(), 0.0);
    }

    #[test]
    fn test_frame_stats_average_tracks_frames() {
        let mut stats = FrameStats::new();
        for _ in 0..200 {
            stats.record_frame(Duration::from_millis(10));
        }
        let avg = stats.average_frame_time();
        assert!(avg > Duration::from_micros(9_900) && avg < Duration::from_micros(10_100));
        assert!((stats.fps() - 100.0).abs() < 1.0);
        assert_eq!(stats.frame_time(), Duration::from_millis(10));
    }

    #[test]
    fn test_frame_stats_blocked_accumulates() {
        let mut stats = FrameStats::new();
        stats.record_blocked(Duration::from_millis(3));
        stats.record_blocked(Duration::from_millis(4));
        assert_eq!(stats.blocked(), Duration::from_millis(4));
        assert_eq!(stats.blocked_total(), Duration::from_millis(7));
    }

    #[test]
    fn test_frame_stats_device_time_starts_unknown() {
        let mut stats = FrameStats::new();
        assert_eq!(stats.device_time(), None);
        assert_eq!(stats.average_device_time(), None);

        stats.record_device_time(Duration::from_millis(4));
        assert_eq!(stats.device_time(), Some(Duration::from_millis(4)));
        assert_eq!(stats.average_device_time(), Some(Duration::from_millis(4)));
        assert_eq!(stats.device_frames(), 1);
    }

    #[test]
    fn test_frame_stats_device_average_tracks_frames() {
        let mut stats = FrameStats::new();
        stats.record_device_time(Duration::from_millis(20));
        for _ in 0..200 {
            stats.record_device_time(Duration::from_millis(2));
        }
        let avg = stats.average_device_time().unwrap();
        assert!(avg > Duration::from_micros(1_900) && avg < Duration::from_micros(2_100));
        assert_eq!(stats.device_time(), Some(Duration::from_millis(2)));
    }
}
