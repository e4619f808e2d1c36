//! Bounded, chunked byte queue backing a connection's pending writes.
//!
//! Data is stored in fixed-granularity chunks so a slow drain never
//! pins one huge allocation. Writers go through [`ByteQueue::writer`],
//! which hands out an exclusive guard: that is the single-writer gate
//! keeping the reactor's drain path and a foreign thread's `send` from
//! interleaving partial writes.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::config::BusLimits;
use crate::error::{BusError, Result};

#[derive(Debug)]
struct QueueInner {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk.
    front_offset: usize,
    len: usize,
}

/// Bounded chunked byte queue.
#[derive(Debug)]
pub struct ByteQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    chunk_size: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::with_capacity(
            BusLimits::WRITE_QUEUE_CAPACITY,
            BusLimits::WRITE_QUEUE_CHUNK_SIZE,
        )
    }

    pub fn with_capacity(capacity: usize, chunk_size: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::new(),
                front_offset: 0,
                len: 0,
            }),
            capacity,
            chunk_size,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("byte queue poisoned").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire the exclusive writer gate.
    pub fn writer(&self) -> QueueWriter<'_> {
        QueueWriter {
            guard: self.inner.lock().expect("byte queue poisoned"),
            capacity: self.capacity,
            chunk_size: self.chunk_size,
        }
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle over the queue; holds the writer gate until dropped.
pub struct QueueWriter<'a> {
    guard: MutexGuard<'a, QueueInner>,
    capacity: usize,
    chunk_size: usize,
}

impl QueueWriter<'_> {
    pub fn len(&self) -> usize {
        self.guard.len
    }

    pub fn is_empty(&self) -> bool {
        self.guard.len == 0
    }

    /// Free space remaining before the capacity bound.
    pub fn available(&self) -> usize {
        self.capacity - self.guard.len
    }

    /// Append bytes; all-or-nothing against the capacity bound.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        if data.len() > self.available() {
            return Err(BusError::QueueFull {
                requested: data.len(),
                capacity: self.capacity,
            });
        }

        // Top up the tail chunk first, then add whole chunks.
        if let Some(tail) = self.guard.chunks.back_mut() {
            let room = self.chunk_size.saturating_sub(tail.len());
            let take = room.min(data.len());
            if take > 0 {
                tail.extend_from_slice(&data[..take]);
                data = &data[take..];
                self.guard.len += take;
            }
        }
        while !data.is_empty() {
            let take = self.chunk_size.min(data.len());
            self.guard.chunks.push_back(data[..take].to_vec());
            data = &data[take..];
            self.guard.len += take;
        }
        Ok(())
    }

    /// Borrow the contiguous unread front of the queue, if any.
    pub fn front(&self) -> Option<&[u8]> {
        let off = self.guard.front_offset;
        self.guard.chunks.front().map(|c| &c[off..])
    }

    /// Copy up to `buf.len()` bytes starting at `offset` without
    /// consuming them; returns the number of bytes copied.
    pub fn peek(&self, offset: usize, buf: &mut [u8]) -> usize {
        let mut skipped = 0usize;
        let mut copied = 0usize;
        let mut pos = self.guard.front_offset;
        for chunk in &self.guard.chunks {
            let avail = &chunk[pos..];
            pos = 0;
            let start = offset.saturating_sub(skipped).min(avail.len());
            skipped += avail.len();
            let src = &avail[start..];
            let take = src.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&src[..take]);
            copied += take;
            if copied == buf.len() {
                break;
            }
        }
        copied
    }

    /// Consume `n` bytes from the front.
    pub fn discard(&mut self, mut n: usize) {
        n = n.min(self.guard.len);
        self.guard.len -= n;
        while n > 0 {
            let consumed = {
                let off = self.guard.front_offset;
                let front = self.guard.chunks.front().expect("len accounted");
                let avail = front.len() - off;
                avail.min(n)
            };
            n -= consumed;
            self.guard.front_offset += consumed;
            let exhausted = {
                let front = self.guard.chunks.front().expect("len accounted");
                self.guard.front_offset == front.len()
            };
            if exhausted {
                self.guard.chunks.pop_front();
                self.guard.front_offset = 0;
            }
        }
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.guard.chunks.clear();
        self.guard.front_offset = 0;
        self.guard.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_drain() {
        let q = ByteQueue::with_capacity(64, 8);
        let mut w = q.writer();
        w.append(b"hello").unwrap();
        w.append(b" world").unwrap();
        assert_eq!(w.len(), 11);

        let mut out = Vec::new();
        while let Some(front) = w.front() {
            out.extend_from_slice(front);
            let n = front.len();
            w.discard(n);
        }
        assert_eq!(out, b"hello world");
        assert!(w.is_empty());
    }

    #[test]
    fn test_append_spans_chunks() {
        let q = ByteQueue::with_capacity(1024, 4);
        let mut w = q.writer();
        w.append(b"0123456789").unwrap();
        // Front chunk is bounded by the chunk size.
        assert!(w.front().unwrap().len() <= 4);

        let mut buf = [0u8; 10];
        assert_eq!(w.peek(0, &mut buf), 10);
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn test_peek_with_offset() {
        let q = ByteQueue::with_capacity(64, 4);
        let mut w = q.writer();
        w.append(b"abcdefgh").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(w.peek(3, &mut buf), 3);
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn test_capacity_bound_is_all_or_nothing() {
        let q = ByteQueue::with_capacity(8, 4);
        let mut w = q.writer();
        w.append(b"123456").unwrap();
        let err = w.append(b"789").unwrap_err();
        assert!(matches!(err, BusError::QueueFull { .. }));
        // Nothing partial was queued.
        assert_eq!(w.len(), 6);

        w.discard(4);
        w.append(b"789").unwrap();
        assert_eq!(w.len(), 5);
    }

    #[test]
    fn test_discard_across_chunk_boundary() {
        let q = ByteQueue::with_capacity(64, 4);
        let mut w = q.writer();
        w.append(b"abcdefgh").unwrap();
        w.discard(6);
        assert_eq!(w.front().unwrap(), b"gh");
    }
}
