//! Timestamp query pool.
//!
//! Queries are used in pairs: a start stamp at the top of the pipe and an end
//! stamp at the bottom. [`TimestampPool::elapsed`] turns a pair into a
//! [`Duration`] using the device's tick period.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// VkQueryPool of timestamp queries.
pub struct TimestampPool {
    device: Arc<Device>,
    pool: vk::QueryPool,
    count: u32,
    /// Nanoseconds per timestamp tick.
    period_ns: f64,
    /// Bits of a timestamp the queue actually writes.
    valid_mask: u64,
}

impl TimestampPool {
    /// Create `count` timestamp queries for a queue writing `valid_bits` bits
    /// per stamp, ticking every `period_ns` nanoseconds.
    pub fn new(device: Arc<Device>, count: u32, period_ns: f32, valid_bits: u32) -> RhiResult<Self> {
        if valid_bits == 0 {
            return Err(RhiError::ContractViolation(
                "queue family does not support timestamps".to_string(),
            ));
        }

        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        let pool = unsafe { device.handle().create_query_pool(&create_info, None)? };

        debug!(
            "Created timestamp pool: {} queries, {} ns per tick, {} valid bits",
            count, period_ns, valid_bits
        );

        Ok(Self {
            device,
            pool,
            count,
            period_ns: f64::from(period_ns),
            valid_mask: valid_mask(valid_bits),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::QueryPool {
        self.pool
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Time between the stamps in queries `first` and `first + 1`, or `None`
    /// when they have not both been written yet.
    pub fn elapsed(&self, first: u32) -> RhiResult<Option<Duration>> {
        if first + 1 >= self.count {
            return Err(RhiError::ContractViolation(format!(
                "timestamp pair {} outside a pool of {}",
                first, self.count
            )));
        }

        let mut stamps = [0u64; 2];
        let result = unsafe {
            self.device.handle().get_query_pool_results(
                self.pool,
                first,
                &mut stamps,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => Ok(Some(ticks_to_duration(
                stamps[0],
                stamps[1],
                self.valid_mask,
                self.period_ns,
            ))),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimestampPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_query_pool(self.pool, None);
        }
        debug!("Destroyed timestamp pool");
    }
}

fn valid_mask(valid_bits: u32) -> u64 {
    if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    }
}

/// Span between two raw stamps, tolerating one counter wrap.
fn ticks_to_duration(start: u64, end: u64, mask: u64, period_ns: f64) -> Duration {
    let ticks = end.wrapping_sub(start) & mask;
    Duration::from_nanos((ticks as f64 * period_ns) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_mask() {
        assert_eq!(valid_mask(64), u64::MAX);
        assert_eq!(valid_mask(36), 0xF_FFFF_FFFF);
    }

    #[test]
    fn test_ticks_scale_by_period() {
        let elapsed = ticks_to_duration(1_000, 3_000, u64::MAX, 1.0);
        assert_eq!(elapsed, Duration::from_nanos(2_000));

        let elapsed = ticks_to_duration(0, 1_000_000, u64::MAX, 2.5);
        assert_eq!(elapsed, Duration::from_nanos(2_500_000));
    }

    #[test]
    fn test_ticks_survive_counter_wrap() {
        let mask = valid_mask(36);
        let elapsed = ticks_to_duration(mask - 9, 10, mask, 1.0);
        assert_eq!(elapsed, Duration::from_nanos(20));
    }

    #[test]
    fn test_timestamp_pool_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TimestampPool>();
    }
}
