//! Byte FIFO with packet-length markers.
//!
//! Packets cross between the radio task and the audio pipeline as a stream of
//! bytes plus a parallel stream of length markers. Each direction has exactly
//! one producer and one consumer running in different scheduling contexts:
//!
//! | Queue | Producer | Consumer |
//! |-------|----------|----------|
//! | RX | radio task | audio layer |
//! | TX | audio layer | radio task |
//!
//! Both rings are lock-free single-producer/single-consumer buffers. Slots are
//! atomics, so the whole module is free of `unsafe`. Writes never block and
//! never overwrite: a full ring rejects the write and the caller decides
//! whether to retry or drop.
//!
//! # Example
//!
//! ```
//! use loradv_rs_esp32::radio::ByteQueue;
//!
//! let queue = ByteQueue::new(64, 4);
//! assert!(queue.push_packet(b"hello"));
//!
//! let mut out = Vec::new();
//! assert_eq!(queue.pop_packet(&mut out), Some(5));
//! assert_eq!(out, b"hello");
//! ```

use std::sync::atomic::{AtomicU16, AtomicU8, AtomicUsize, Ordering};

/// A ring slot that can be written by the producer and read by the consumer
/// without locking.
pub trait Slot: Default + Send + Sync {
    /// Value stored in the slot.
    type Value: Copy;

    /// Read the slot. Visibility is provided by the ring indices.
    fn get(&self) -> Self::Value;

    /// Write the slot. Visibility is provided by the ring indices.
    fn set(&self, value: Self::Value);
}

impl Slot for AtomicU8 {
    type Value = u8;

    fn get(&self) -> u8 {
        self.load(Ordering::Relaxed)
    }

    fn set(&self, value: u8) {
        self.store(value, Ordering::Relaxed)
    }
}

impl Slot for AtomicU16 {
    type Value = u16;

    fn get(&self) -> u16 {
        self.load(Ordering::Relaxed)
    }

    fn set(&self, value: u16) {
        self.store(value, Ordering::Relaxed)
    }
}

/// Single-producer/single-consumer ring buffer.
///
/// `head` is only advanced by the consumer and `tail` only by the producer.
/// Both are free-running counters; the capacity is a power of two so slot
/// indices stay consistent when the counters wrap.
struct Ring<S: Slot> {
    slots: Box<[S]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<S: Slot> Ring<S> {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| S::default()).collect(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    fn free(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Producer side.
    fn push(&self, value: S::Value) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity() {
            return false;
        }
        self.slots[tail & self.mask].set(value);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side.
    fn peek(&self) -> Option<S::Value> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        Some(self.slots[head & self.mask].get())
    }

    /// Consumer side.
    fn pop(&self) -> Option<S::Value> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.slots[head & self.mask].get();
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

/// Capacity-bounded byte FIFO with a parallel FIFO of packet lengths.
///
/// Capacities are rounded up to the next power of two.
pub struct ByteQueue {
    data: Ring<AtomicU8>,
    index: Ring<AtomicU16>,
}

impl ByteQueue {
    /// Create a queue holding up to `data_capacity` bytes and
    /// `index_capacity` length markers.
    pub fn new(data_capacity: usize, index_capacity: usize) -> Self {
        Self {
            data: Ring::with_capacity(data_capacity),
            index: Ring::with_capacity(index_capacity),
        }
    }

    /// Append one byte. Returns `false` if the data ring is full.
    pub fn push_byte(&self, byte: u8) -> bool {
        self.data.push(byte)
    }

    /// Append one packet-length marker. Returns `false` if the index ring is
    /// full.
    pub fn push_length(&self, len: u16) -> bool {
        self.index.push(len)
    }

    /// Remove the oldest byte.
    pub fn pop_byte(&self) -> Option<u8> {
        self.data.pop()
    }

    /// Remove the oldest length marker.
    pub fn pop_length(&self) -> Option<u16> {
        self.index.pop()
    }

    /// Oldest length marker without removing it.
    pub fn peek_length(&self) -> Option<u16> {
        self.index.peek()
    }

    /// Number of bytes currently enqueued.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of length markers currently enqueued.
    pub fn packet_count(&self) -> usize {
        self.index.len()
    }

    /// True if at least one length marker is enqueued.
    pub fn has_packet(&self) -> bool {
        self.packet_count() > 0
    }

    /// Free space in the data ring.
    pub fn free_bytes(&self) -> usize {
        self.data.free()
    }

    /// Free space in the index ring.
    pub fn free_lengths(&self) -> usize {
        self.index.free()
    }

    /// Data ring capacity in bytes.
    pub fn data_capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Producer side: enqueue a whole packet.
    ///
    /// The bytes are made visible before the length marker, so a consumer
    /// that observes the length can always read the full packet. Nothing is
    /// written if either ring lacks space.
    pub fn push_packet(&self, packet: &[u8]) -> bool {
        let Ok(len) = u16::try_from(packet.len()) else {
            return false;
        };
        if packet.is_empty() || self.free_bytes() < packet.len() || self.free_lengths() == 0 {
            return false;
        }
        for &byte in packet {
            if !self.data.push(byte) {
                return false;
            }
        }
        self.index.push(len)
    }

    /// Consumer side: dequeue a whole packet, appending its bytes to `out`.
    ///
    /// Returns `None` when no packet is queued or its bytes have not all
    /// arrived yet; in that case nothing is consumed.
    pub fn pop_packet(&self, out: &mut Vec<u8>) -> Option<usize> {
        let len = self.index.peek()? as usize;
        if self.data.len() < len {
            return None;
        }
        self.index.pop();
        out.reserve(len);
        for _ in 0..len {
            out.push(self.data.pop()?);
        }
        Some(len)
    }
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteQueue")
            .field("bytes", &self.size())
            .field("packets", &self.packet_count())
            .field("data_capacity", &self.data.capacity())
            .field("index_capacity", &self.index.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bytes_are_fifo() {
        let queue = ByteQueue::new(8, 2);
        for b in 1..=5 {
            assert!(queue.push_byte(b));
        }
        assert_eq!(queue.size(), 5);
        for b in 1..=5 {
            assert_eq!(queue.pop_byte(), Some(b));
        }
        assert_eq!(queue.pop_byte(), None);
    }

    #[test]
    fn test_capacity_rounded_to_power_of_two() {
        let queue = ByteQueue::new(100, 3);
        assert_eq!(queue.data_capacity(), 128);
        assert_eq!(queue.free_lengths(), 4);
    }

    #[test]
    fn test_full_data_ring_rejects_without_overwrite() {
        let queue = ByteQueue::new(4, 4);
        for b in 0..4 {
            assert!(queue.push_byte(b));
        }
        assert!(!queue.push_byte(99));
        assert_eq!(queue.size(), 4);
        assert_eq!(queue.pop_byte(), Some(0));
        assert!(queue.push_byte(4));
        let drained: Vec<u8> = std::iter::from_fn(|| queue.pop_byte()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_full_index_ring_rejects() {
        let queue = ByteQueue::new(16, 2);
        assert!(queue.push_length(1));
        assert!(queue.push_length(2));
        assert!(!queue.push_length(3));
        assert_eq!(queue.pop_length(), Some(1));
        assert_eq!(queue.peek_length(), Some(2));
        assert_eq!(queue.pop_length(), Some(2));
        assert_eq!(queue.pop_length(), None);
    }

    #[test]
    fn test_push_packet_is_all_or_nothing() {
        let queue = ByteQueue::new(8, 1);
        assert!(queue.push_packet(&[1, 2, 3]));
        // Index ring is full: no bytes may leak into the data ring
        assert!(!queue.push_packet(&[4, 5]));
        assert_eq!(queue.size(), 3);

        let mut out = Vec::new();
        assert_eq!(queue.pop_packet(&mut out), Some(3));

        // Data ring too small
        assert!(!queue.push_packet(&[0; 9]));
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.packet_count(), 0);
    }

    #[test]
    fn test_push_packet_rejects_empty() {
        let queue = ByteQueue::new(8, 2);
        assert!(!queue.push_packet(&[]));
        assert!(!queue.has_packet());
    }

    #[test]
    fn test_pop_packet_waits_for_all_bytes() {
        let queue = ByteQueue::new(16, 4);
        assert!(queue.push_length(3));
        assert!(queue.push_byte(10));

        let mut out = Vec::new();
        assert_eq!(queue.pop_packet(&mut out), None);
        assert_eq!(queue.packet_count(), 1);

        assert!(queue.push_byte(11));
        assert!(queue.push_byte(12));
        assert_eq!(queue.pop_packet(&mut out), Some(3));
        assert_eq!(out, vec![10, 11, 12]);
    }

    #[test]
    fn test_wraparound_keeps_framing() {
        let queue = ByteQueue::new(16, 4);
        let mut out = Vec::new();
        for round in 0..1000u32 {
            let len = (round % 7 + 1) as usize;
            let packet: Vec<u8> = (0..len).map(|i| (round as usize + i) as u8).collect();
            assert!(queue.push_packet(&packet));
            out.clear();
            assert_eq!(queue.pop_packet(&mut out), Some(len));
            assert_eq!(out, packet);
        }
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const PACKETS: u32 = 20_000;
        let queue = Arc::new(ByteQueue::new(256, 16));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PACKETS {
                    let len = (seq % 13 + 1) as usize;
                    let packet: Vec<u8> = (0..len).map(|i| (seq as usize + i) as u8).collect();
                    while !queue.push_packet(&packet) {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut out = Vec::new();
        for seq in 0..PACKETS {
            out.clear();
            while queue.pop_packet(&mut out).is_none() {
                thread::yield_now();
            }
            let len = (seq % 13 + 1) as usize;
            let expected: Vec<u8> = (0..len).map(|i| (seq as usize + i) as u8).collect();
            assert_eq!(out, expected, "packet {}", seq);
        }

        producer.join().unwrap();
        assert!(!queue.has_packet());
    }
}
