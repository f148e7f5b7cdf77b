//! Ring Buffer Implementation

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Default buffer capacity (3000 samples = ~10 min at 5Hz)
pub const DEFAULT_CAPACITY: usize = 3000;

/// Errors creating a ring buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Ring buffer capacity must be at least 1")]
    ZeroCapacity,
}

/// Items that carry a wall-clock timestamp
pub trait Timestamped {
    /// Unix milliseconds
    fn timestamp_ms(&self) -> u64;
}

struct Slots<T> {
    /// Pre-allocated storage
    storage: Vec<Option<T>>,
    /// Next write position
    head: usize,
    /// Number of valid entries
    len: usize,
}

/// Circular history buffer with overwrite-oldest semantics.
///
/// Critical sections are a slot write or a clone-out, so the writer is never
/// held up by a slow consumer.
pub struct RingBuffer<T> {
    slots: Mutex<Slots<T>>,
    /// Capacity of the buffer
    capacity: usize,
    /// Total items written (for statistics)
    total_written: AtomicUsize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a new ring buffer holding exactly `capacity` items
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self::allocate(capacity))
    }

    /// Create a buffer with default capacity (3000 samples)
    pub fn with_default_capacity() -> Self {
        Self::allocate(DEFAULT_CAPACITY)
    }

    /// `capacity` must be non-zero
    fn allocate(capacity: usize) -> Self {
        let mut storage = Vec::with_capacity(capacity);
        storage.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(Slots {
                storage,
                head: 0,
                len: 0,
            }),
            capacity,
            total_written: AtomicUsize::new(0),
        }
    }

    /// Push an item (overwrites oldest if full)
    pub fn push(&self, item: T) {
        let mut slots = self.slots.lock();
        let head = slots.head;
        slots.storage[head] = Some(item);
        slots.head = (head + 1) % self.capacity;
        if slots.len < self.capacity {
            slots.len += 1;
        }
        drop(slots);
        self.total_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the number of items currently in the buffer
    pub fn len(&self) -> usize {
        self.slots.lock().len
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Most recent item
    pub fn latest(&self) -> Option<T> {
        let slots = self.slots.lock();
        if slots.len == 0 {
            return None;
        }
        let idx = (slots.head + self.capacity - 1) % self.capacity;
        slots.storage[idx].clone()
    }

    /// Read the last N items (most recent first)
    pub fn read_last(&self, count: usize) -> Vec<T> {
        let slots = self.slots.lock();
        let count = count.min(slots.len);
        (1..=count)
            .filter_map(|i| {
                let idx = (slots.head + self.capacity - i) % self.capacity;
                slots.storage[idx].clone()
            })
            .collect()
    }

    /// Get total items written (for statistics)
    pub fn total_written(&self) -> usize {
        self.total_written.load(Ordering::Relaxed)
    }

    /// Clear the buffer
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.storage.iter_mut().for_each(|slot| *slot = None);
        slots.len = 0;
    }
}

impl<T: Clone + Timestamped> RingBuffer<T> {
    /// Read items within a time window (duration in milliseconds), most
    /// recent first
    pub fn read_window(&self, duration_ms: u64, now_ms: u64) -> Vec<T> {
        let cutoff = now_ms.saturating_sub(duration_ms);
        self.read_last(self.capacity)
            .into_iter()
            .take_while(|item| item.timestamp_ms() >= cutoff)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        timestamp_ms: u64,
        rpm: u16,
    }

    impl Timestamped for Sample {
        fn timestamp_ms(&self) -> u64 {
            self.timestamp_ms
        }
    }

    fn sample(i: u64) -> Sample {
        Sample {
            timestamp_ms: i * 1000,
            rpm: (i * 100) as u16,
        }
    }

    #[test]
    fn test_push_and_read() {
        let buffer = RingBuffer::new(10).unwrap();

        for i in 0..5 {
            buffer.push(sample(i));
        }

        assert_eq!(buffer.len(), 5);

        let items = buffer.read_last(3);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].rpm, 400); // Most recent
        assert_eq!(items[2].rpm, 200);
        assert_eq!(buffer.latest().map(|s| s.rpm), Some(400));
    }

    #[test]
    fn test_overwrite_oldest() {
        let buffer = RingBuffer::new(5).unwrap();

        // Fill beyond capacity
        for i in 0..10 {
            buffer.push(sample(i));
        }

        assert_eq!(buffer.len(), 5);
        assert!(buffer.is_full());
        let rpms: Vec<u16> = buffer.read_last(10).iter().map(|s| s.rpm).collect();
        assert_eq!(rpms, vec![900, 800, 700, 600, 500]);
        assert_eq!(buffer.total_written(), 10);
    }

    #[test]
    fn test_fill_ratio() {
        let buffer = RingBuffer::new(100).unwrap();
        assert_eq!(buffer.fill_ratio(), 0.0);

        for i in 0..50 {
            buffer.push(sample(i));
        }

        assert!((buffer.fill_ratio() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_window_and_clear() {
        let buffer = RingBuffer::new(10).unwrap();
        for i in 0..6 {
            buffer.push(sample(i));
        }
        let window = buffer.read_window(2000, 5000);
        assert_eq!(window.len(), 3);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.latest(), None);
    }

    #[test]
    fn test_default_capacity_wraps_like_new() {
        let buffer = RingBuffer::with_default_capacity();
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
        assert!(buffer.is_empty());
        for i in 0..(DEFAULT_CAPACITY as u64 + 1) {
            buffer.push(sample(i));
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.latest().map(|s| s.timestamp_ms), Some(DEFAULT_CAPACITY as u64 * 1000));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            RingBuffer::<Sample>::new(0),
            Err(BufferError::ZeroCapacity)
        ));
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..64, pushes in 0usize..256) {
            let buffer = RingBuffer::new(capacity).unwrap();
            for i in 0..pushes {
                buffer.push(i);
            }
            prop_assert_eq!(buffer.len(), pushes.min(capacity));
            let expected: Vec<usize> = (0..pushes).rev().take(capacity).collect();
            prop_assert_eq!(buffer.read_last(capacity), expected);
        }
    }
}
