//! Lock-free SPSC byte rings connecting the transport thread and the
//! audio callback. One producer, one consumer, both wait-free; a full
//! ring rejects writes and an empty ring reports zero readable bytes.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(unix)]
use tracing::warn;

struct Inner {
    // Free-running positions; fill level is write - read.
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    mask: usize,
    data: Box<[UnsafeCell<u8>]>,
}

unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn read_space(&self) -> usize {
        self.write_pos
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_pos.load(Ordering::Acquire))
    }

    fn write_space(&self) -> usize {
        self.capacity() - self.read_space()
    }

    unsafe fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = unsafe { *self.data[pos.wrapping_add(i) & self.mask].get() };
        }
    }

    unsafe fn copy_in(&self, pos: usize, src: &[u8]) {
        for (i, byte) in src.iter().enumerate() {
            unsafe { *self.data[pos.wrapping_add(i) & self.mask].get() = *byte };
        }
    }

    fn clear(&self) {
        let w = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(w, Ordering::Release);
    }
}

/// Producer end. Must stay on a single thread.
pub struct RingProducer {
    inner: Arc<Inner>,
}

/// Consumer end. Must stay on a single thread.
pub struct RingConsumer {
    inner: Arc<Inner>,
}

/// Side-neutral handle that can only drop queued data. Used when port
/// connections go away and every ring has to be emptied at once.
pub struct RingClearer {
    inner: Arc<Inner>,
}

unsafe impl Send for RingProducer {}
unsafe impl Send for RingConsumer {}
unsafe impl Send for RingClearer {}

/// Creates a ring of at least `capacity` bytes (rounded up to a power of
/// two) and locks its storage into RAM so the audio thread never faults.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let capacity = capacity.next_power_of_two();
    let mut data = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        data.push(UnsafeCell::new(0_u8));
    }
    let inner = Arc::new(Inner {
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        mask: capacity - 1,
        data: data.into_boxed_slice(),
    });
    #[cfg(unix)]
    {
        let rc = unsafe {
            nix::libc::mlock(
                inner.data.as_ptr() as *const nix::libc::c_void,
                inner.data.len(),
            )
        };
        if rc != 0 {
            warn!(
                "Could not lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    (
        RingProducer {
            inner: inner.clone(),
        },
        RingConsumer { inner },
    )
}

impl RingProducer {
    pub fn write_space(&self) -> usize {
        self.inner.write_space()
    }

    /// All-or-nothing write; returns false when the ring is full.
    pub fn write(&self, src: &[u8]) -> bool {
        if src.len() > self.inner.write_space() {
            return false;
        }
        let w = self.inner.write_pos.load(Ordering::Relaxed);
        unsafe { self.inner.copy_in(w, src) };
        self.inner
            .write_pos
            .store(w.wrapping_add(src.len()), Ordering::Release);
        true
    }

    pub fn clearer(&self) -> RingClearer {
        RingClearer {
            inner: self.inner.clone(),
        }
    }
}

impl RingConsumer {
    pub fn read_space(&self) -> usize {
        self.inner.read_space()
    }

    /// Reads up to `dst.len()` bytes, returning the amount copied.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.inner.read_space());
        let r = self.inner.read_pos.load(Ordering::Relaxed);
        unsafe { self.inner.copy_out(r, &mut dst[..n]) };
        self.inner
            .read_pos
            .store(r.wrapping_add(n), Ordering::Release);
        n
    }

    /// Copies without consuming.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.inner.read_space());
        let r = self.inner.read_pos.load(Ordering::Relaxed);
        unsafe { self.inner.copy_out(r, &mut dst[..n]) };
        n
    }

    /// Discards up to `n` bytes without copying.
    pub fn advance(&self, n: usize) {
        let n = n.min(self.inner.read_space());
        let r = self.inner.read_pos.load(Ordering::Relaxed);
        self.inner
            .read_pos
            .store(r.wrapping_add(n), Ordering::Release);
    }

    pub fn clearer(&self) -> RingClearer {
        RingClearer {
            inner: self.inner.clone(),
        }
    }
}

impl RingClearer {
    pub fn clear(&self) {
        self.inner.clear();
    }
}

pub fn f32_bytes(samples: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(samples.as_ptr() as *const u8, std::mem::size_of_val(samples))
    }
}

pub fn f32_bytes_mut(samples: &mut [f32]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            samples.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(samples),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ring_buffer;

    #[test]
    fn write_read_roundtrip() {
        let (producer, consumer) = ring_buffer(64);
        assert!(producer.write(&[1, 2, 3, 4]));
        assert_eq!(consumer.read_space(), 4);
        let mut buf = [0_u8; 4];
        assert_eq!(consumer.read(&mut buf), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(consumer.read_space(), 0);
    }

    #[test]
    fn empty_ring_reads_nothing() {
        let (_producer, consumer) = ring_buffer(16);
        let mut buf = [0_u8; 8];
        assert_eq!(consumer.read_space(), 0);
        assert_eq!(consumer.read(&mut buf), 0);
    }

    #[test]
    fn full_ring_rejects_writes() {
        let (producer, consumer) = ring_buffer(16);
        assert!(producer.write(&[0_u8; 16]));
        assert!(!producer.write(&[1]));
        consumer.advance(8);
        assert!(producer.write(&[1_u8; 8]));
    }

    #[test]
    fn peek_does_not_consume() {
        let (producer, consumer) = ring_buffer(16);
        producer.write(&[9, 8, 7]);
        let mut buf = [0_u8; 3];
        assert_eq!(consumer.peek(&mut buf), 3);
        assert_eq!(buf, [9, 8, 7]);
        assert_eq!(consumer.read_space(), 3);
        consumer.advance(3);
        assert_eq!(consumer.read_space(), 0);
    }

    #[test]
    fn wraparound_preserves_order() {
        let (producer, consumer) = ring_buffer(8);
        let mut buf = [0_u8; 8];
        for round in 0..10_u8 {
            let chunk = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert!(producer.write(&chunk));
            assert_eq!(consumer.read(&mut buf[..3]), 3);
            assert_eq!(&buf[..3], &chunk);
        }
    }

    #[test]
    fn clear_empties_from_either_handle() {
        let (producer, consumer) = ring_buffer(32);
        producer.write(&[0_u8; 20]);
        producer.clearer().clear();
        assert_eq!(consumer.read_space(), 0);
        producer.write(&[1_u8; 4]);
        consumer.clearer().clear();
        assert_eq!(consumer.read_space(), 0);
    }

    #[test]
    fn cross_thread_transfer() {
        let (producer, consumer) = ring_buffer(1024);
        let handle = std::thread::spawn(move || {
            for i in 0..1000_u32 {
                while !producer.write(&i.to_le_bytes()) {
                    std::thread::yield_now();
                }
            }
        });
        let mut buf = [0_u8; 4];
        for i in 0..1000_u32 {
            loop {
                if consumer.read_space() >= 4 {
                    consumer.read(&mut buf);
                    assert_eq!(u32::from_le_bytes(buf), i);
                    break;
                }
                std::thread::yield_now();
            }
        }
        handle.join().unwrap();
    }
}
