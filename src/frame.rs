//! Frames and the bounded frame buffer.
//!
//! - `Frame`: decoded pixel buffer (interleaved 8-bit, 1 or 3 channels) plus capture time.
//! - `FrameBuffer`: bounded drop-oldest FIFO shared by the producer and the consumer.
//!
//! Frames are stored as `Arc<Frame>` so the producer can keep a "last frame" slot
//! without copying every frame twice. Consumers always receive an owned `Frame`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

use thiserror::Error;

/// Default buffer capacity: 8 seconds at 30 fps.
pub const DEFAULT_BUFFER_FRAMES: usize = 240;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u8),
    #[error("frame data length {actual} does not match {expected} expected bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("crop region ({x1},{y1})-({x2},{y2}) is empty or out of bounds")]
    BadCrop { x1: u32, y1: u32, x2: u32, y2: u32 },
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Monotonic capture instant (ordering, freeze detection).
    pub captured_at: Instant,
    /// Wall-clock capture time (capture metadata).
    pub wall_time: SystemTime,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            data,
            width,
            height,
            channels,
            captured_at: Instant::now(),
            wall_time: SystemTime::now(),
        }
    }

    /// Solid-colour RGB frame. Handy for tests and synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, 3)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if !matches!(self.channels, 1 | 3) {
            return Err(FrameError::UnsupportedChannels(self.channels));
        }
        if self.data.len() != self.expected_len() {
            return Err(FrameError::LengthMismatch {
                expected: self.expected_len(),
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Copy out the half-open region `[x1, x2) x [y1, y2)`.
    pub fn crop(&self, x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Frame, FrameError> {
        if x2 <= x1 || y2 <= y1 || x2 > self.width || y2 > self.height {
            return Err(FrameError::BadCrop { x1, y1, x2, y2 });
        }
        let channels = self.channels as usize;
        let row_bytes = (x2 - x1) as usize * channels;
        let stride = self.width as usize * channels;
        let mut data = Vec::with_capacity(row_bytes * (y2 - y1) as usize);
        for row in y1 as usize..y2 as usize {
            let start = row * stride + x1 as usize * channels;
            let slice = self
                .data
                .get(start..start + row_bytes)
                .ok_or(FrameError::BadCrop { x1, y1, x2, y2 })?;
            data.extend_from_slice(slice);
        }
        Ok(Frame {
            data,
            width: x2 - x1,
            height: y2 - y1,
            channels: self.channels,
            captured_at: self.captured_at,
            wall_time: self.wall_time,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Take ownership of a shared frame, copying only if someone else still holds it.
    pub fn from_shared(frame: Arc<Frame>) -> Frame {
        Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone())
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Bounded drop-oldest FIFO.
///
/// - `push` never blocks on capacity: when full, the oldest frame is evicted.
/// - `pop` never waits for data: an empty buffer returns `None` immediately.
/// - The internal lock is held only for the queue operation itself.
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Arc<Frame>>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_FRAMES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    // A poisoned lock only means another thread panicked mid-operation on a
    // VecDeque, which leaves it structurally valid.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Frame>>> {
        match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Push a frame, evicting the oldest when at capacity. Returns the number evicted.
    pub fn push(&self, frame: Arc<Frame>) -> usize {
        let mut frames = self.lock();
        let mut evicted = 0;
        while frames.len() >= self.capacity {
            frames.pop_front();
            evicted += 1;
        }
        frames.push_back(frame);
        evicted
    }

    /// Pop the oldest retained frame.
    pub fn pop(&self) -> Option<Arc<Frame>> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every buffered frame. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let dropped = frames.len();
        frames.clear();
        dropped
    }

    /// Evict oldest frames until at most `keep` remain. Returns how many were evicted.
    pub fn trim_to(&self, keep: usize) -> usize {
        let mut frames = self.lock();
        let mut evicted = 0;
        while frames.len() > keep {
            frames.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Release spare queue allocation beyond the current occupancy.
    pub fn shrink(&self) {
        self.lock().shrink_to_fit();
    }

    /// Memory usage estimate of buffered pixel data.
    pub fn memory_bytes(&self) -> usize {
        self.lock().iter().map(|f| f.byte_len()).sum()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: u8) -> Arc<Frame> {
        Arc::new(Frame::new(vec![tag; 4 * 4 * 3], 4, 4, 3))
    }

    #[test]
    fn frame_buffer_enforces_capacity() {
        let buf = FrameBuffer::with_capacity(8);
        for i in 0..50u8 {
            buf.push(tagged(i));
            assert!(buf.len() <= 8);
        }
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn frame_buffer_evicts_oldest_first() {
        let buf = FrameBuffer::with_capacity(3);
        assert_eq!(buf.push(tagged(1)), 0);
        assert_eq!(buf.push(tagged(2)), 0);
        assert_eq!(buf.push(tagged(3)), 0);
        assert_eq!(buf.push(tagged(4)), 1);

        let order: Vec<u8> = std::iter::from_fn(|| buf.pop()).map(|f| f.data[0]).collect();
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn pop_on_empty_returns_none_immediately() {
        let buf = FrameBuffer::new();
        assert!(buf.pop().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn trim_to_keeps_most_recent() {
        let buf = FrameBuffer::with_capacity(100);
        for i in 0..70u8 {
            buf.push(tagged(i));
        }
        assert_eq!(buf.trim_to(30), 40);
        assert_eq!(buf.len(), 30);
        assert_eq!(buf.pop().map(|f| f.data[0]), Some(40));
    }

    #[test]
    fn clear_reports_dropped_frames() {
        let buf = FrameBuffer::with_capacity(10);
        buf.push(tagged(1));
        buf.push(tagged(2));
        assert_eq!(buf.clear(), 2);
        assert!(buf.is_empty());
        assert_eq!(buf.memory_bytes(), 0);
    }

    #[test]
    fn validate_rejects_bad_frames() {
        let mut frame = Frame::filled(4, 4, [0, 0, 0]);
        assert!(frame.validate().is_ok());

        frame.data.truncate(10);
        assert!(matches!(
            frame.validate(),
            Err(FrameError::LengthMismatch { .. })
        ));

        let empty = Frame::new(vec![], 0, 480, 3);
        assert!(matches!(
            empty.validate(),
            Err(FrameError::EmptyDimensions { .. })
        ));
    }

    #[test]
    fn crop_copies_region() {
        let mut frame = Frame::filled(4, 4, [0, 0, 0]);
        // Mark pixel (2, 1).
        let idx = (4 + 2) * 3;
        frame.data[idx] = 255;

        let sub = frame.crop(1, 1, 3, 3).unwrap();
        assert_eq!((sub.width, sub.height), (2, 2));
        assert_eq!(sub.data[3], 255);
        assert!(frame.crop(3, 0, 3, 2).is_err());
        assert!(frame.crop(0, 0, 5, 2).is_err());
    }

    #[test]
    fn from_shared_copies_only_when_shared() {
        let shared = tagged(9);
        let keep = shared.clone();
        let owned = Frame::from_shared(shared);
        assert_eq!(owned.data[0], 9);
        assert_eq!(Arc::strong_count(&keep), 1);
    }
}
