//! Fixed-capacity byte rings shared between pipeline stages.
//!
//! - [`RingBuffer`] carries decoded PCM from the decoder to the player.
//! - [`OverflowRing`] carries compressed input from the network to the decoder and can
//!   always present its head as one contiguous slice, even across the physical wrap.
//!
//! Both are single-owner structures driven from one cooperative task. Writing past
//! `write_available()` or consuming past `read_available()` is an accounting bug upstream
//! and panics rather than corrupting data.

/// Fixed-capacity byte FIFO with separate read/write cursors.
///
/// A byte count disambiguates full from empty, so the whole capacity is usable.
pub struct RingBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn write_available(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Bytes buffered and not yet read.
    pub fn read_available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy all of `data` into the ring.
    ///
    /// Panics if `data` is larger than [`write_available`](Self::write_available).
    pub fn write(&mut self, data: &[u8]) -> usize {
        assert!(
            data.len() <= self.write_available(),
            "ring overflow: writing {} bytes with {} free",
            data.len(),
            self.write_available()
        );
        let cap = self.buf.len();
        let first = data.len().min(cap - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);
        self.write_pos = (self.write_pos + data.len()) % cap;
        self.len += data.len();
        data.len()
    }

    /// Copy up to `dest.len()` buffered bytes out; returns the count copied.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.len);
        let cap = self.buf.len();
        let first = n.min(cap - self.read_pos);
        dest[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        dest[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read_pos = (self.read_pos + n) % cap;
        self.len -= n;
        n
    }

    /// Like [`read`](Self::read) but never copies more than `max` bytes.
    pub fn read_into(&mut self, dest: &mut [u8], max: usize) -> usize {
        let n = max.min(dest.len());
        self.read(&mut dest[..n])
    }

    /// Contiguous free region starting at the write cursor.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let cap = self.buf.len();
        let end = if self.len == cap {
            self.write_pos
        } else if self.write_pos >= self.read_pos {
            cap
        } else {
            self.read_pos
        };
        &mut self.buf[self.write_pos..end]
    }

    /// Commit `n` bytes placed through [`writable_slice`](Self::writable_slice).
    pub fn bytes_written(&mut self, n: usize) {
        assert!(
            n <= self.write_available(),
            "ring overflow: committing {n} bytes with {} free",
            self.write_available()
        );
        self.write_pos = (self.write_pos + n) % self.buf.len();
        self.len += n;
    }

    /// Contiguous buffered region starting at the read cursor.
    pub fn readable_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        let end = if self.read_pos < self.write_pos {
            self.write_pos
        } else {
            self.buf.len()
        };
        &self.buf[self.read_pos..end]
    }

    /// Release `n` bytes observed through [`readable_slice`](Self::readable_slice).
    pub fn bytes_read(&mut self, n: usize) {
        assert!(
            n <= self.len,
            "ring underflow: releasing {n} bytes with {} buffered",
            self.len
        );
        self.read_pos = (self.read_pos + n) % self.buf.len();
        self.len -= n;
    }

    /// Drop all buffered bytes. Memory contents are left as-is.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }
}

/// Byte ring with a staging area in front of the ring storage.
///
/// Layout: `[staging: overflow][ring: capacity]`. When the unread data wraps and fewer than
/// `overflow` bytes remain before the physical end, [`contiguous`](Self::contiguous) copies
/// those tail bytes into the end of the staging area. The tail then runs straight into the
/// wrapped data at the start of the ring, so the whole unread window is one slice.
pub struct OverflowRing {
    buf: Box<[u8]>,
    overflow: usize,
    /// Absolute index into `buf`; below `overflow` while a tail is staged.
    read_pos: usize,
    /// Absolute index into `buf`, always within the ring part.
    write_pos: usize,
    len: usize,
}

impl OverflowRing {
    pub fn new(capacity: usize, overflow: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        assert!(
            overflow <= capacity,
            "staging area ({overflow}) larger than ring ({capacity})"
        );
        Self {
            buf: vec![0u8; overflow + capacity].into_boxed_slice(),
            overflow,
            read_pos: overflow,
            write_pos: overflow,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() - self.overflow
    }

    /// Size of the staging area; the minimum contiguous run [`contiguous`](Self::contiguous)
    /// guarantees.
    pub fn overflow(&self) -> usize {
        self.overflow
    }

    pub fn write_available(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn read_available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy all of `data` into the ring. Panics on overflow.
    pub fn write(&mut self, data: &[u8]) -> usize {
        assert!(
            data.len() <= self.write_available(),
            "input ring overflow: writing {} bytes with {} free",
            data.len(),
            self.write_available()
        );
        let end = self.buf.len();
        let first = data.len().min(end - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[self.overflow..self.overflow + rest].copy_from_slice(&data[first..]);
            self.write_pos = self.overflow + rest;
        } else {
            self.write_pos += first;
            if self.write_pos == end {
                self.write_pos = self.overflow;
            }
        }
        self.len += data.len();
        data.len()
    }

    /// Unread bytes starting at the read cursor as one slice.
    ///
    /// The slice holds at least `min(read_available(), overflow())` bytes.
    pub fn contiguous(&mut self) -> &[u8] {
        let end = self.buf.len();
        if self.read_pos >= self.overflow && self.read_pos + self.len > end {
            let tail = end - self.read_pos;
            if tail < self.overflow {
                let dst = self.overflow - tail;
                self.buf.copy_within(self.read_pos..end, dst);
                self.read_pos = dst;
            }
        }
        let run = self.len.min(end - self.read_pos);
        &self.buf[self.read_pos..self.read_pos + run]
    }

    /// Advance the read cursor by `n` bytes. Panics on underflow.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.len,
            "input ring underflow: consuming {n} bytes with {} buffered",
            self.len
        );
        let end = self.buf.len();
        let mut pos = self.read_pos + n;
        if pos >= end {
            pos = self.overflow + (pos - end);
        }
        self.read_pos = pos;
        self.len -= n;
    }

    /// Copy up to `max` unread bytes into `dest`, following the wrap.
    pub fn read_into(&mut self, dest: &mut [u8], max: usize) -> usize {
        let n = max.min(dest.len()).min(self.len);
        let end = self.buf.len();
        let first = n.min(end - self.read_pos);
        dest[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        let rest = n - first;
        dest[first..n].copy_from_slice(&self.buf[self.overflow..self.overflow + rest]);
        self.consume(n);
        n
    }

    pub fn reset(&mut self) {
        self.read_pos = self.overflow;
        self.write_pos = self.overflow;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random sizes for interleaving tests.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((self.0 >> 33) as usize) % bound.max(1)
        }
    }

    fn pattern(start: usize, len: usize) -> Vec<u8> {
        (start..start + len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn ring_counts_stay_within_capacity() {
        let mut ring = RingBuffer::new(97);
        let mut rng = Lcg(7);
        let mut written = 0usize;
        let mut read = 0usize;
        for _ in 0..2_000 {
            match rng.next(4) {
                0 => {
                    let n = rng.next(ring.write_available() + 1);
                    ring.write(&pattern(written, n));
                    written += n;
                }
                1 => {
                    let mut out = vec![0u8; rng.next(64)];
                    let n = ring.read(&mut out);
                    assert_eq!(&out[..n], pattern(read, n).as_slice());
                    read += n;
                }
                2 => {
                    let slice = ring.writable_slice();
                    let n = rng.next(slice.len() + 1);
                    slice[..n].copy_from_slice(&pattern(written, n));
                    ring.bytes_written(n);
                    written += n;
                }
                _ => {
                    let slice = ring.readable_slice();
                    let n = rng.next(slice.len() + 1);
                    assert_eq!(&slice[..n], pattern(read, n).as_slice());
                    ring.bytes_read(n);
                    read += n;
                }
            }
            assert!(ring.read_available() <= ring.capacity());
            assert_eq!(ring.read_available() + ring.write_available(), ring.capacity());
            assert_eq!(ring.read_available(), written - read);
        }
    }

    #[test]
    fn ring_uses_full_capacity() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.write(&[1; 8]), 8);
        assert_eq!(ring.write_available(), 0);
        assert!(ring.writable_slice().is_empty());
        let mut out = [0u8; 8];
        assert_eq!(ring.read_into(&mut out, 3), 3);
        assert_eq!(ring.write_available(), 3);
    }

    #[test]
    #[should_panic(expected = "ring overflow")]
    fn ring_write_past_free_space_panics() {
        let mut ring = RingBuffer::new(4);
        ring.write(&[0; 5]);
    }

    #[test]
    #[should_panic(expected = "ring underflow")]
    fn ring_release_past_buffered_panics() {
        let mut ring = RingBuffer::new(4);
        ring.write(&[0; 2]);
        ring.bytes_read(3);
    }

    #[test]
    fn ring_reset_empties() {
        let mut ring = RingBuffer::new(4);
        ring.write(&[1, 2, 3]);
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.write_available(), 4);
        assert!(ring.readable_slice().is_empty());
    }

    #[test]
    fn overflow_ring_preserves_sequence_across_wrap() {
        for seed in 1..40u64 {
            let mut rng = Lcg(seed);
            let capacity = 64 + rng.next(200);
            let overflow = 1 + rng.next(capacity.min(48));
            let mut ring = OverflowRing::new(capacity, overflow);
            let total = capacity * 6;
            let mut written = 0usize;
            let mut got = Vec::with_capacity(total);

            while got.len() < total {
                let room = ring.write_available().min(total - written);
                let n = rng.next(room + 1);
                ring.write(&pattern(written, n));
                written += n;

                let want = ring.read_available().min(overflow);
                let run = ring.contiguous();
                assert!(run.len() >= want, "run {} < {want}", run.len());
                let take = rng.next(run.len() + 1);
                got.extend_from_slice(&run[..take]);
                ring.consume(take);

                if written == total {
                    while !ring.is_empty() {
                        let run = ring.contiguous().to_vec();
                        got.extend_from_slice(&run);
                        ring.consume(run.len());
                    }
                }
            }
            assert_eq!(got, pattern(0, total), "seed {seed}");
        }
    }

    #[test]
    fn overflow_ring_stages_short_tail() {
        let mut ring = OverflowRing::new(16, 4);
        ring.write(&pattern(0, 14));
        let mut sink = [0u8; 14];
        assert_eq!(ring.read_into(&mut sink, 13), 13);
        // 3 unread bytes before the physical end, the rest wraps.
        ring.write(&pattern(14, 6));
        let run = ring.contiguous();
        assert_eq!(run, pattern(13, 7).as_slice());
        ring.consume(7);
        assert!(ring.is_empty());
        assert_eq!(ring.write_available(), 16);
    }

    #[test]
    fn overflow_ring_write_while_staged_keeps_order() {
        let mut ring = OverflowRing::new(16, 4);
        ring.write(&pattern(0, 16));
        let mut sink = [0u8; 16];
        ring.read_into(&mut sink, 14);
        ring.write(&pattern(16, 4));
        assert_eq!(ring.contiguous(), pattern(14, 6).as_slice());
        ring.consume(1);
        ring.write(&pattern(20, 11));
        assert_eq!(ring.read_available(), 16);
        let mut out = vec![0u8; 16];
        assert_eq!(ring.read_into(&mut out, 16), 16);
        assert_eq!(out, pattern(15, 16));
    }

    #[test]
    #[should_panic(expected = "input ring overflow")]
    fn overflow_ring_write_past_capacity_panics() {
        let mut ring = OverflowRing::new(8, 2);
        ring.write(&[0; 9]);
    }
}
