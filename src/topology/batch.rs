// SPDX-License-Identifier: Apache-2.0

use crate::topology::payload::TelemetryRecord;
use std::time::Duration;

pub const DEFAULT_BUFFER_PERIOD: Duration = Duration::from_millis(800);
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Flush thresholds of a span buffer. A zero `period` disables time based flushing and a
/// zero `count` disables count based flushing, but not both at once. `capacity` bounds
/// the records accepted but not yet picked up by the buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferPolicy {
    pub period: Duration,
    pub count: usize,
    pub capacity: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            period: DEFAULT_BUFFER_PERIOD,
            count: 0,
            capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferPolicyError {
    #[error("buffer period and count are both zero, the buffer would never flush")]
    NeverFlushes,
    #[error("buffer capacity must be greater than zero")]
    ZeroCapacity,
}

impl BufferPolicy {
    pub fn validate(&self) -> Result<(), BufferPolicyError> {
        if self.period.is_zero() && self.count == 0 {
            return Err(BufferPolicyError::NeverFlushes);
        }
        if self.capacity == 0 {
            return Err(BufferPolicyError::ZeroCapacity);
        }
        Ok(())
    }

    pub(crate) fn timer_enabled(&self) -> bool {
        !self.period.is_zero()
    }
}

/// The in-progress batch of a span buffer.
pub(crate) struct PendingBatch {
    items: Vec<TelemetryRecord>,
    max_count: usize,
}

impl PendingBatch {
    pub(crate) fn new(max_count: usize) -> Self {
        Self {
            items: Vec::with_capacity(max_count.min(DEFAULT_BUFFER_CAPACITY)),
            max_count,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn take_batch(&mut self) -> Vec<TelemetryRecord> {
        std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.max_count.min(DEFAULT_BUFFER_CAPACITY)),
        )
    }

    /// Appends a record, harvesting the batch when it reaches the count threshold.
    pub(crate) fn offer(&mut self, record: TelemetryRecord) -> Option<Vec<TelemetryRecord>> {
        self.items.push(record);
        if self.max_count > 0 && self.items.len() >= self.max_count {
            return Some(self.take_batch());
        }
        None
    }
}
