//! Ring buffer of tracked frames shared between the acquisition thread and
//! the data sender.
//!
//! The driver pushes at the acquisition rate; the sender pulls everything
//! newer than its watermark, bounded by a per-cycle budget. When the buffer
//! wraps before the sender catches up, the sender observes
//! `oldest_timestamp()` ahead of its watermark and skips forward.

use crate::core::types::TrackedFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default capacity: ten seconds of frames at the default 50 Hz rate.
pub const DEFAULT_CAPACITY: usize = 500;

pub struct FrameBuffer {
    /// Channel identifier matched against the configured `OutputChannelId`
    channel_id: String,
    inner: Mutex<VecDeque<TrackedFrame>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(channel_id: &str) -> Self {
        Self::with_capacity(channel_id, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(channel_id: &str, capacity: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Append a frame, dropping the oldest when full.
    pub fn push(&self, frame: TrackedFrame) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        self.inner.lock().front().map(|f| f.timestamp)
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.inner.lock().back().map(|f| f.timestamp)
    }

    /// Frames strictly newer than `after`, oldest first, at most `max`.
    pub fn frames_since(&self, after: f64, max: usize) -> Vec<TrackedFrame> {
        let inner = self.inner.lock();
        inner
            .iter()
            .filter(|f| f.timestamp > after)
            .take(max)
            .cloned()
            .collect()
    }
}
