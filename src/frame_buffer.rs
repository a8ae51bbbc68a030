/// PCM frame buffer module
///
/// Ring buffer sitting between the audio callback and the analysis loop.
/// Holds mono f32 PCM; the callback writes through a shared reference
/// while the analysis side pulls fixed-size windows.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// PCM sample format (f32, -1.0 to 1.0, mono)
pub type PcmSample = f32;

/// Ring buffer size: 1 second at the default capture rate
pub const BUFFER_DURATION_SECS: usize = 1;
pub const DEFAULT_SAMPLE_RATE: usize = 44_100;
pub const BUFFER_SIZE: usize = BUFFER_DURATION_SECS * DEFAULT_SAMPLE_RATE;

#[derive(Error, Debug)]
pub enum FrameBufferError {
    #[error("Buffer underflow: attempted to read {0} samples, but only {1} available")]
    Underflow(usize, usize),

    #[error("Invalid buffer capacity: {0}")]
    InvalidCapacity(usize),
}

type RingBuffer = HeapRb<PcmSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Ring buffer for PCM samples
///
/// Producer and consumer halves are locked separately so the capture
/// callback and the analysis loop do not contend on a single mutex.
pub struct FrameBuffer {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
    sample_rate: usize,
}

impl FrameBuffer {
    /// Create a buffer with default 1-second capacity
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE)
    }

    /// Create a buffer with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        debug!("Creating frame buffer with capacity: {} samples", capacity);

        let rb = HeapRb::<PcmSample>::new(capacity.max(1));
        let (producer, consumer) = rb.split();

        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    /// Write PCM samples to the buffer (non-blocking)
    ///
    /// Returns the number of samples accepted. If the buffer is full,
    /// the oldest samples are dropped to make room; the analysis loop
    /// only ever needs the most recent window.
    pub fn write(&self, samples: &[PcmSample]) -> usize {
        let mut producer = self.producer.lock().unwrap();

        let requested = samples.len();
        let capacity = producer.capacity().get();

        // A chunk larger than the whole buffer reduces to its newest
        // `capacity` samples; the head of the chunk is the oldest data
        let newest = if requested > capacity {
            &samples[requested - capacity..]
        } else {
            samples
        };

        let available_space = producer.vacant_len();

        if newest.len() > available_space {
            // Bounded by occupied_len once the chunk fits the capacity
            let to_drop = newest.len() - available_space;
            let mut consumer = self.consumer.lock().unwrap();
            consumer.skip(to_drop);
            drop(consumer);

            warn!(
                "Frame buffer full, dropping {} oldest samples to make room",
                requested - available_space
            );
        }

        producer.push_slice(newest);
        requested
    }

    /// Read samples from the buffer without removing them (peek)
    pub fn peek(&self, count: usize) -> Vec<PcmSample> {
        let consumer = self.consumer.lock().unwrap();
        let available = consumer.occupied_len();
        let to_read = count.min(available);

        let mut result = Vec::with_capacity(to_read);
        for item in consumer.iter().take(to_read) {
            result.push(*item);
        }

        result
    }

    /// Read and remove exactly `count` samples from the buffer
    pub fn read(&self, count: usize) -> Result<Vec<PcmSample>, FrameBufferError> {
        let mut consumer = self.consumer.lock().unwrap();
        let available = consumer.occupied_len();

        if count > available {
            return Err(FrameBufferError::Underflow(count, available));
        }

        let mut result = vec![0.0; count];
        let read = consumer.pop_slice(&mut result);
        result.truncate(read);

        Ok(result)
    }

    /// Pull one analysis window if enough samples have accumulated
    ///
    /// Returns None when fewer than `window` samples are buffered; the
    /// caller polls again on its own cadence.
    pub fn read_window(&self, window: usize) -> Option<Vec<PcmSample>> {
        let mut consumer = self.consumer.lock().unwrap();
        if consumer.occupied_len() < window {
            return None;
        }

        let mut result = vec![0.0; window];
        let read = consumer.pop_slice(&mut result);
        result.truncate(read);
        Some(result)
    }

    /// Get the number of samples currently in the buffer
    pub fn len(&self) -> usize {
        let consumer = self.consumer.lock().unwrap();
        consumer.occupied_len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        let consumer = self.consumer.lock().unwrap();
        consumer.capacity().get()
    }

    /// Get the amount of free space in the buffer
    pub fn free_space(&self) -> usize {
        let producer = self.producer.lock().unwrap();
        producer.vacant_len()
    }

    /// Clear all data from the buffer
    pub fn clear(&self) {
        let mut consumer = self.consumer.lock().unwrap();
        let occupied = consumer.occupied_len();
        consumer.skip(occupied);
        debug!("Cleared frame buffer");
    }

    /// Get the sample rate
    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Get duration of audio currently in buffer (in seconds)
    pub fn duration_secs(&self) -> f32 {
        self.len() as f32 / self.sample_rate as f32
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_buffer_creation() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.capacity(), BUFFER_SIZE);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.sample_rate(), DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_write_and_read() {
        let buffer = FrameBuffer::with_capacity(1000);
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();

        let written = buffer.write(&samples);
        assert_eq!(written, 100);
        assert_eq!(buffer.len(), 100);

        let read = buffer.read(50).unwrap();
        assert_eq!(read.len(), 50);
        assert_eq!(buffer.len(), 50);
        assert_relative_eq!(read[0], 0.0);
        assert_relative_eq!(read[49], 0.49);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let buffer = FrameBuffer::with_capacity(1000);
        let samples: Vec<f32> = vec![0.1, 0.2, 0.3, 0.4, 0.5];

        buffer.write(&samples);
        let peeked = buffer.peek(3);

        assert_eq!(peeked, vec![0.1, 0.2, 0.3]);
        assert_eq!(buffer.len(), 5); // No samples removed
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let buffer = FrameBuffer::with_capacity(100);
        let samples: Vec<f32> = vec![0.5; 150];

        let written = buffer.write(&samples);
        assert_eq!(written, 150);
        assert_eq!(buffer.len(), 100); // Only capacity remains
    }

    #[test]
    fn test_oversized_write_keeps_newest_samples() {
        let buffer = FrameBuffer::with_capacity(100);
        let samples: Vec<f32> = (0..150).map(|i| i as f32).collect();

        let written = buffer.write(&samples);
        assert_eq!(written, 150);
        assert_eq!(buffer.len(), 100);

        // The head of the chunk counts as the oldest data: it goes first
        let data = buffer.read(100).unwrap();
        assert_relative_eq!(data[0], 50.0);
        assert_relative_eq!(data[99], 149.0);
    }

    #[test]
    fn test_oversized_write_on_partially_filled_buffer() {
        let buffer = FrameBuffer::with_capacity(100);
        buffer.write(&vec![-1.0; 80]);

        let samples: Vec<f32> = (0..150).map(|i| i as f32).collect();
        buffer.write(&samples);

        // Prior contents and the chunk's head are both displaced
        assert_eq!(buffer.len(), 100);
        let data = buffer.read(100).unwrap();
        assert_relative_eq!(data[0], 50.0);
        assert_relative_eq!(data[99], 149.0);
    }

    #[test]
    fn test_buffer_underflow() {
        let buffer = FrameBuffer::with_capacity(100);
        buffer.write(&vec![0.5; 50]);

        let result = buffer.read(100);
        assert!(result.is_err());

        match result {
            Err(FrameBufferError::Underflow(requested, available)) => {
                assert_eq!(requested, 100);
                assert_eq!(available, 50);
            }
            _ => panic!("Expected Underflow error"),
        }
    }

    #[test]
    fn test_read_window() {
        let buffer = FrameBuffer::with_capacity(1000);

        // Not enough samples yet
        buffer.write(&vec![0.1; 100]);
        assert!(buffer.read_window(256).is_none());
        assert_eq!(buffer.len(), 100);

        // Enough after a second write
        buffer.write(&vec![0.1; 200]);
        let window = buffer.read_window(256).unwrap();
        assert_eq!(window.len(), 256);
        assert_eq!(buffer.len(), 44);
    }

    #[test]
    fn test_clear() {
        let buffer = FrameBuffer::with_capacity(1000);
        buffer.write(&vec![0.5; 500]);
        assert_eq!(buffer.len(), 500);

        buffer.clear();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duration_calculation() {
        let buffer = FrameBuffer::new();
        buffer.write(&vec![0.0; DEFAULT_SAMPLE_RATE]); // 1 second of audio

        assert_relative_eq!(buffer.duration_secs(), 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_ring_buffer_wrapping() {
        let buffer = FrameBuffer::with_capacity(10);

        buffer.write(&vec![1.0; 10]);
        assert_eq!(buffer.len(), 10);

        // Write more data (should overwrite oldest)
        buffer.write(&vec![2.0; 5]);
        assert_eq!(buffer.len(), 10); // Still at capacity

        let data = buffer.peek(10);
        assert_relative_eq!(data[0], 1.0);
        assert_relative_eq!(data[9], 2.0);
    }

    #[test]
    fn test_free_space() {
        let buffer = FrameBuffer::with_capacity(100);
        assert_eq!(buffer.free_space(), 100);

        buffer.write(&vec![0.5; 30]);
        assert_eq!(buffer.free_space(), 70);

        buffer.read(10).unwrap();
        assert_eq!(buffer.free_space(), 80);
    }
}
