//! A fixed-capacity ring of fixed-size byte buffers used as the
//! single-producer / single-consumer pipe between the read side of one TCP
//! socket and the write side of its peer.
//!
//! Both the producer (the transfer reading its own socket) and the
//! consumer (the peer transfer draining into its own socket) run on the
//! reactor thread, so no synchronization is needed here at all.

/// One buffer in the ring: a fixed-size byte array plus a filled window
/// `[start, end)`. `start` is the drain cursor, `end` is the fill cursor.
struct FixedBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl FixedBuffer {
    fn new(size: usize) -> Self {
        FixedBuffer {
            data: vec![0u8; size].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The unwritten tail of the buffer, safe to read a socket into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// The unwritten-to-socket window, safe to write out.
    pub fn filled(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn commit_written(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len());
        self.end += n;
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start += n;
    }
}

/// A bounded ring of `capacity` buffers, each `buffer_size` bytes.
///
/// Invariants: `0 <= pending() <= capacity`; at most one buffer is
/// partially filled (the tail, returned by `reserve_for_write`) and one
/// partially drained (the head, returned by `head_for_drain`) at a time; a
/// buffer returns to the free pool only once fully drained.
pub struct BufferQueue {
    buffer_size: usize,
    capacity: usize,
    buffers: std::collections::VecDeque<FixedBuffer>,
    free: Vec<FixedBuffer>,
}

impl BufferQueue {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        assert!(capacity > 0, "bufferCount must be > 0");
        assert!(buffer_size > 0, "bufferSize must be > 0");
        BufferQueue {
            buffer_size,
            capacity,
            buffers: std::collections::VecDeque::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    /// Number of non-empty buffers currently queued.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Total bytes buffered across all queued buffers.
    pub fn pending_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.end - b.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// True when no more bytes can be accepted without a buffer being
    /// drained first.
    pub fn is_full(&self) -> bool {
        self.buffers.len() >= self.capacity && self.buffers.back().map_or(true, |b| b.is_full())
    }

    /// Returns the tail buffer to read a socket into: the buffer currently
    /// being filled if it has spare capacity, else a fresh buffer from the
    /// free pool if the ring has room, else `None` if the queue is full.
    pub fn reserve_for_write(&mut self) -> Option<&mut FixedBuffer> {
        let need_new = match self.buffers.back() {
            Some(tail) if !tail.is_full() => false,
            _ => true,
        };
        if need_new {
            if self.buffers.len() >= self.capacity {
                return None;
            }
            let buf = self.free.pop().unwrap_or_else(|| FixedBuffer::new(self.buffer_size));
            self.buffers.push_back(buf);
        }
        self.buffers.back_mut()
    }

    /// Returns the oldest buffer to drain into a socket, if any non-empty
    /// buffer is queued.
    pub fn head_for_drain(&mut self) -> Option<&mut FixedBuffer> {
        match self.buffers.front() {
            Some(b) if !b.is_empty() => self.buffers.front_mut(),
            _ => None,
        }
    }

    /// Releases the head buffer back to the free pool once it has been
    /// fully drained. Called by the writer after `head_for_drain` reports
    /// `is_empty()`.
    pub fn advance_head(&mut self) {
        if let Some(mut buf) = self.buffers.pop_front() {
            buf.reset();
            self.free.push(buf);
        }
    }
}

pub use self::FixedBuffer as Buffer;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_drain_round_trip() {
        let mut q = BufferQueue::new(2, 4);
        assert!(q.is_empty());
        {
            let buf = q.reserve_for_write().unwrap();
            buf.spare_mut()[..3].copy_from_slice(b"abc");
            buf.commit_written(3);
        }
        assert_eq!(q.pending(), 1);
        assert_eq!(q.pending_bytes(), 3);
        {
            let buf = q.head_for_drain().unwrap();
            assert_eq!(buf.filled(), b"abc");
            buf.consume(3);
            assert!(buf.is_empty());
        }
        q.advance_head();
        assert!(q.is_empty());
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn fills_to_capacity_then_reports_full() {
        let mut q = BufferQueue::new(1, 1);
        assert!(!q.is_full());
        {
            let buf = q.reserve_for_write().unwrap();
            buf.spare_mut()[0] = 1;
            buf.commit_written(1);
        }
        assert!(q.is_full());
        assert!(q.reserve_for_write().is_none());

        {
            let buf = q.head_for_drain().unwrap();
            buf.consume(1);
        }
        q.advance_head();
        assert!(!q.is_full());
        assert!(q.reserve_for_write().is_some());
    }

    #[test]
    fn byte_at_a_time_pipelining_never_exceeds_capacity() {
        let mut q = BufferQueue::new(1, 1);
        for byte in 0u8..16 {
            let buf = q.reserve_for_write().expect("queue must accept after drain");
            buf.spare_mut()[0] = byte;
            buf.commit_written(1);
            assert!(q.pending() <= 1);

            let buf = q.head_for_drain().unwrap();
            assert_eq!(buf.filled(), &[byte]);
            buf.consume(1);
            q.advance_head();
        }
        assert!(q.is_empty());
    }

    #[test]
    fn reuses_drained_buffers_from_the_free_pool() {
        let mut q = BufferQueue::new(2, 4);
        for _ in 0..5 {
            {
                let buf = q.reserve_for_write().unwrap();
                buf.commit_written(4);
            }
            {
                let buf = q.head_for_drain().unwrap();
                buf.consume(4);
            }
            q.advance_head();
        }
        assert!(q.is_empty());
    }
}
