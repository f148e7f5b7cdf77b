//! History Ring Buffer
//!
//! Fixed-capacity circular buffer for monitoring samples. One writer, one
//! reader, oldest entry overwritten when full. Storage never grows.

mod buffer;

pub use buffer::{BufferError, RingBuffer, Timestamped, DEFAULT_CAPACITY};
