//! Lock-free single-producer single-consumer byte ring buffer
//!
//! The backing store holds `size` bytes, `size` a power of two. One byte is
//! always left unused so that `write == read` means empty, giving a usable
//! capacity of `size - 1`.
//!
//! Each side owns one cursor. A side publishes with a release store on its
//! own cursor and observes the other side with an acquire load, so a byte
//! written before `advance_write` is visible to the consumer that sees the
//! new write cursor. No locks are taken and nothing allocates after
//! [`RingBuffer::new`].
//!
//! ```text
//!             read                 write
//!              v                     v
//! [ . . . . . |x x x x x x x x x x x| . . . . . . ]
//!              <----- read_space --> <- write_space (wraps) ->
//! ```

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use jackal_common::consts::CACHE_LINE_SIZE;
use nix::errno::Errno;
use nix::sys::mman;
use static_assertions::const_assert_eq;

/// Keeps each cursor on its own cache line.
#[repr(C, align(64))]
struct CachePadded<T>(T);

const_assert_eq!(core::mem::align_of::<CachePadded<AtomicUsize>>(), CACHE_LINE_SIZE);

struct Shared {
    buf: Box<[UnsafeCell<u8>]>,
    size: usize,
    mask: usize,
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
}

// SAFETY: the producer only writes bytes in [write, read - 1) and the
// consumer only reads bytes in [read, write); the cursors hand regions over
// with release/acquire pairs, so no byte is accessed by both sides at once.
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8.
        self.buf.as_ptr() as *mut u8
    }

    #[inline]
    fn write_space(&self, w: usize, r: usize) -> usize {
        r.wrapping_sub(w).wrapping_sub(1) & self.mask
    }

    #[inline]
    fn read_space(&self, w: usize, r: usize) -> usize {
        w.wrapping_sub(r) & self.mask
    }

    /// Up to two spans of `len` bytes starting at `start`, wrapping at the end.
    #[inline]
    fn spans(&self, start: usize, len: usize) -> ((usize, usize), (usize, usize)) {
        let end = start + len;
        if end > self.size {
            ((start, self.size - start), (0, end & self.mask))
        } else {
            ((start, len), (0, 0))
        }
    }
}

/// An unsplit ring buffer.
///
/// Setup-time operations (`mlock`, `reset`) live here; call
/// [`RingBuffer::split`] to obtain the two realtime-safe halves.
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Allocate a buffer of at least `capacity` bytes, rounded up to a power
    /// of two. Usable capacity is one byte less than the allocated size.
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(2).next_power_of_two();
        let buf = (0..size).map(|_| UnsafeCell::new(0u8)).collect();
        Self {
            shared: Arc::new(Shared {
                buf,
                size,
                mask: size - 1,
                write: CachePadded(AtomicUsize::new(0)),
                read: CachePadded(AtomicUsize::new(0)),
            }),
        }
    }

    /// Allocated size in bytes (a power of two).
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Bytes that can be held at once.
    pub fn capacity(&self) -> usize {
        self.shared.size - 1
    }

    /// Pin the backing store in RAM. Call before entering the RT path.
    pub fn mlock(&self) -> std::io::Result<()> {
        let addr = NonNull::new(self.shared.base().cast::<c_void>())
            .ok_or_else(|| std::io::Error::from(Errno::EINVAL))?;
        // SAFETY: the range is the buffer's own allocation, alive as long as `self`.
        unsafe { mman::mlock(addr, self.shared.size) }.map_err(std::io::Error::from)
    }

    /// Empty the buffer and zero its contents.
    ///
    /// Requires exclusive access, so it cannot race either side.
    pub fn reset(&mut self) {
        self.shared.write.0.store(0, Ordering::Relaxed);
        self.shared.read.0.store(0, Ordering::Relaxed);
        // SAFETY: not yet split, so `self` is the only handle.
        unsafe { std::ptr::write_bytes(self.shared.base(), 0, self.shared.size) };
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (Producer, Consumer) {
        (
            Producer {
                shared: Arc::clone(&self.shared),
            },
            Consumer {
                shared: self.shared,
            },
        )
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &self.shared.size)
            .finish()
    }
}

/// Writing half of a [`RingBuffer`].
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Bytes that can be written right now. A lower bound: the consumer
    /// may free more space concurrently.
    #[inline]
    pub fn write_space(&self) -> usize {
        let w = self.shared.write.0.load(Ordering::Relaxed);
        let r = self.shared.read.0.load(Ordering::Acquire);
        self.shared.write_space(w, r)
    }

    /// Bytes currently readable, as seen from the producer side.
    #[inline]
    pub fn read_space(&self) -> usize {
        let w = self.shared.write.0.load(Ordering::Relaxed);
        let r = self.shared.read.0.load(Ordering::Acquire);
        self.shared.read_space(w, r)
    }

    /// The writable region as up to two spans (the second is empty unless
    /// the region wraps). Publish with [`Producer::advance_write`].
    #[inline]
    pub fn write_vector(&mut self) -> (&mut [u8], &mut [u8]) {
        let w = self.shared.write.0.load(Ordering::Relaxed);
        let r = self.shared.read.0.load(Ordering::Acquire);
        let free = self.shared.write_space(w, r);
        let ((a, alen), (b, blen)) = self.shared.spans(w, free);
        let base = self.shared.base();
        // SAFETY: both spans lie in the free region, which the consumer does
        // not touch until the write cursor moves past it.
        unsafe {
            (
                std::slice::from_raw_parts_mut(base.add(a), alen),
                std::slice::from_raw_parts_mut(base.add(b), blen),
            )
        }
    }

    /// Publish `n` bytes written through [`Producer::write_vector`].
    /// Clamped to the current write space.
    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        let w = self.shared.write.0.load(Ordering::Relaxed);
        let n = n.min(self.write_space());
        self.shared
            .write
            .0
            .store((w + n) & self.shared.mask, Ordering::Release);
    }

    /// Copy as much of `src` as fits. Returns the number of bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let (first, second) = self.write_vector();
        let n = src.len().min(first.len() + second.len());
        let head = n.min(first.len());
        first[..head].copy_from_slice(&src[..head]);
        second[..n - head].copy_from_slice(&src[head..n]);
        self.advance_write(n);
        n
    }
}

/// Reading half of a [`RingBuffer`].
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Bytes that can be read right now. A lower bound: the producer may
    /// publish more concurrently.
    #[inline]
    pub fn read_space(&self) -> usize {
        let w = self.shared.write.0.load(Ordering::Acquire);
        let r = self.shared.read.0.load(Ordering::Relaxed);
        self.shared.read_space(w, r)
    }

    /// Free bytes, as seen from the consumer side.
    #[inline]
    pub fn write_space(&self) -> usize {
        let w = self.shared.write.0.load(Ordering::Acquire);
        let r = self.shared.read.0.load(Ordering::Relaxed);
        self.shared.write_space(w, r)
    }

    /// The readable region as up to two spans. Release with
    /// [`Consumer::advance_read`].
    #[inline]
    pub fn read_vector(&self) -> (&[u8], &[u8]) {
        let w = self.shared.write.0.load(Ordering::Acquire);
        let r = self.shared.read.0.load(Ordering::Relaxed);
        let avail = self.shared.read_space(w, r);
        let ((a, alen), (b, blen)) = self.shared.spans(r, avail);
        let base = self.shared.base();
        // SAFETY: both spans were published by the producer and are not
        // rewritten until the read cursor moves past them.
        unsafe {
            (
                std::slice::from_raw_parts(base.add(a), alen),
                std::slice::from_raw_parts(base.add(b), blen),
            )
        }
    }

    /// Release `n` bytes consumed through [`Consumer::read_vector`].
    /// Clamped to the current read space.
    #[inline]
    pub fn advance_read(&mut self, n: usize) {
        let r = self.shared.read.0.load(Ordering::Relaxed);
        let n = n.min(self.read_space());
        self.shared
            .read
            .0
            .store((r + n) & self.shared.mask, Ordering::Release);
    }

    /// Copy up to `dst.len()` bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let (first, second) = self.read_vector();
        let n = dst.len().min(first.len() + second.len());
        let head = n.min(first.len());
        dst[..head].copy_from_slice(&first[..head]);
        dst[head..n].copy_from_slice(&second[..n - head]);
        n
    }

    /// Copy and consume up to `dst.len()` bytes. Returns the count read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.advance_read(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mlock_pins_or_reports_limit() {
        let rb = RingBuffer::new(4096);
        if let Err(e) = rb.mlock() {
            let errno = e.raw_os_error().map(Errno::from_raw);
            assert!(
                matches!(errno, Some(Errno::EPERM | Errno::ENOMEM | Errno::EAGAIN)),
                "{e}"
            );
        }
    }

    #[test]
    fn test_size_rounds_up() {
        assert_eq!(RingBuffer::new(1000).size(), 1024);
        assert_eq!(RingBuffer::new(1024).size(), 1024);
        assert_eq!(RingBuffer::new(1025).size(), 2048);
        assert_eq!(RingBuffer::new(0).size(), 2);
    }

    #[test]
    fn test_full_buffer_accepts_nothing() {
        let (mut tx, rx) = RingBuffer::new(1024).split();
        assert_eq!(tx.write(&[7u8; 1023]), 1023);
        assert_eq!(tx.write(&[1]), 0);
        assert_eq!(tx.write_space(), 0);
        assert_eq!(rx.read_space(), 1023);
    }

    #[test]
    fn test_vectors_wrap() {
        let (mut tx, mut rx) = RingBuffer::new(8).split();
        assert_eq!(tx.write(&[0, 1, 2, 3, 4, 5]), 6);
        let mut out = [0u8; 5];
        assert_eq!(rx.read(&mut out), 5);

        // write cursor at 6, read cursor at 5: free region wraps.
        let (a, b) = tx.write_vector();
        assert_eq!((a.len(), b.len()), (2, 4));
        a.copy_from_slice(&[6, 7]);
        b[..2].copy_from_slice(&[8, 9]);
        tx.advance_write(4);

        let (a, b) = rx.read_vector();
        assert_eq!(a, &[5, 6, 7]);
        assert_eq!(b, &[8, 9]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut tx, mut rx) = RingBuffer::new(16).split();
        tx.write(b"abc");
        let mut out = [0u8; 3];
        assert_eq!(rx.peek(&mut out), 3);
        assert_eq!(rx.read_space(), 3);
        assert_eq!(rx.read(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(rx.read_space(), 0);
    }

    #[test]
    fn test_advance_is_clamped() {
        let (mut tx, mut rx) = RingBuffer::new(16).split();
        tx.advance_write(100);
        assert_eq!(rx.read_space(), 15);
        rx.advance_read(100);
        assert_eq!(rx.read_space(), 0);
        assert_eq!(tx.write_space(), 15);
    }

    #[test]
    fn test_reset() {
        let mut rb = RingBuffer::new(16);
        rb.reset();
        let (mut tx, rx) = rb.split();
        tx.write(&[1, 2, 3]);
        assert_eq!(rx.read_space() + rx.write_space(), 15);
    }
}
