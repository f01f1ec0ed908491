//! Fixed-size pool of reusable frame buffers
//!
//! The pool is sized once at construction and never grows. `acquire` pops a
//! buffer off a lock-free free list and fails with [`PoolError::Exhausted`]
//! instead of allocating, which is the backpressure signal the pipeline uses
//! to drop a cycle. Leased buffers carry their slot and an `Arc` back to the
//! pool, so a lease that is dropped on an error path still finds its way home.

use crate::error::PoolError;
use crate::types::{FrameGeometry, FrameStamp, PixelFormat};
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Smallest pool that still lets capture of N+1 overlap processing of N
pub const MIN_POOL_SIZE: usize = 2;
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Pool sizing, fixed for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub buffer_count: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes reserved per buffer; at least `format.calculate_size(width, height)`
    pub frame_bytes: usize,
}

impl PoolConfig {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            buffer_count: DEFAULT_POOL_SIZE,
            width,
            height,
            format,
            frame_bytes: format.calculate_size(width, height),
        }
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height, self.format)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.buffer_count < MIN_POOL_SIZE {
            return Err(PoolError::InvalidConfig(format!(
                "buffer_count {} is below the minimum of {}",
                self.buffer_count, MIN_POOL_SIZE
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "frame dimensions {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        let required = self.format.calculate_size(self.width, self.height);
        if self.frame_bytes < required {
            return Err(PoolError::InvalidConfig(format!(
                "frame_bytes {} cannot hold a {}x{} {:?} frame ({} bytes)",
                self.frame_bytes, self.width, self.height, self.format, required
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(1280, 1024, PixelFormat::Mono8)
    }
}

/// Backing memory of one slot. Stored as words so 16-bit samples are aligned.
struct Storage {
    slot: usize,
    words: Box<[u32]>,
}

struct PoolShared {
    free: ArrayQueue<Storage>,
    in_use: Box<[AtomicBool]>,
    generations: Box<[AtomicU64]>,
    geometry: FrameGeometry,
    frame_bytes: usize,
}

impl PoolShared {
    fn give_back(&self, storage: Storage) -> Result<(), PoolError> {
        let slot = storage.slot;
        if !self.in_use[slot].swap(false, Ordering::AcqRel) {
            return Err(PoolError::InvalidRelease("slot is not marked in use"));
        }
        self.generations[slot].fetch_add(1, Ordering::Relaxed);
        self.free
            .push(storage)
            .map_err(|_| PoolError::InvalidRelease("free list already full"))
    }
}

/// Exclusive claim on one pool slot.
///
/// Dropping a lease returns the slot to its pool.
pub struct Lease {
    storage: Option<Storage>,
    generation: u64,
    shared: Arc<PoolShared>,
}

impl Lease {
    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &bytemuck::cast_slice::<u32, u8>(&storage.words)[..self.shared.frame_bytes],
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.shared.frame_bytes;
        match &mut self.storage {
            Some(storage) => &mut bytemuck::cast_slice_mut::<u32, u8>(&mut storage.words)[..len],
            None => &mut [],
        }
    }

    fn slot(&self) -> usize {
        self.storage.as_ref().map(|s| s.slot).unwrap_or(usize::MAX)
    }

    fn give_back(&mut self) -> Result<(), PoolError> {
        match self.storage.take() {
            Some(storage) => self.shared.give_back(storage),
            None => Err(PoolError::InvalidRelease("buffer already returned")),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.storage.is_some() {
            if let Err(e) = self.give_back() {
                log::error!("Frame buffer could not be returned on drop: {}", e);
            }
        }
    }
}

/// A leased buffer that is still being filled by the camera
pub struct FrameBuffer {
    lease: Lease,
}

impl FrameBuffer {
    pub fn geometry(&self) -> FrameGeometry {
        self.lease.shared.geometry
    }

    pub fn slot(&self) -> usize {
        self.lease.slot()
    }

    /// Number of times this slot has been released before this lease
    pub fn generation(&self) -> u64 {
        self.lease.generation
    }

    pub fn pixels(&self) -> &[u8] {
        self.lease.bytes()
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.lease.bytes_mut()
    }

    /// Freeze the buffer into an immutable frame for the given cycle
    pub fn seal(self, stamp: FrameStamp) -> Frame {
        Frame {
            lease: self.lease,
            stamp,
        }
    }
}

/// A filled, immutable frame owned by exactly one pipeline stage at a time
pub struct Frame {
    lease: Lease,
    stamp: FrameStamp,
}

impl Frame {
    pub fn stamp(&self) -> FrameStamp {
        self.stamp
    }

    pub fn sequence(&self) -> u64 {
        self.stamp.sequence
    }

    pub fn trigger_at(&self) -> Instant {
        self.stamp.trigger_at
    }

    pub fn captured_at(&self) -> Instant {
        self.stamp.captured_at
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.lease.shared.geometry
    }

    pub fn width(&self) -> u32 {
        self.lease.shared.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.lease.shared.geometry.height
    }

    pub fn format(&self) -> PixelFormat {
        self.lease.shared.geometry.format
    }

    pub fn slot(&self) -> usize {
        self.lease.slot()
    }

    pub fn generation(&self) -> u64 {
        self.lease.generation
    }

    /// Raw pixel bytes, `stride * height` long
    pub fn pixels(&self) -> &[u8] {
        &self.lease.bytes()[..self.geometry().image_size()]
    }

    /// Raw bytes of row `y`
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.geometry().stride as usize;
        let start = y as usize * stride;
        &self.pixels()[start..start + stride]
    }

    /// Intensity at `(x, y)` scaled to 16 bits
    #[inline]
    pub fn intensity(&self, x: u32, y: u32) -> u16 {
        let geometry = self.geometry();
        let index = y as usize * geometry.width as usize + x as usize;
        geometry.format.intensity(self.lease.bytes(), index)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.stamp.sequence)
            .field("slot", &self.slot())
            .field("geometry", &self.geometry())
            .finish()
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("slot", &self.slot())
            .field("generation", &self.generation())
            .finish()
    }
}

impl From<FrameBuffer> for Lease {
    fn from(buffer: FrameBuffer) -> Self {
        buffer.lease
    }
}

impl From<Frame> for Lease {
    fn from(frame: Frame) -> Self {
        frame.lease
    }
}

/// Pool of pre-allocated frame buffers to eliminate per-frame allocation
#[derive(Clone)]
pub struct FrameBufferPool {
    shared: Arc<PoolShared>,
}

impl FrameBufferPool {
    /// Create a pool and allocate every buffer up front
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let words_per_frame = config.frame_bytes.div_ceil(4);
        let free = ArrayQueue::new(config.buffer_count);
        for slot in 0..config.buffer_count {
            let storage = Storage {
                slot,
                words: vec![0u32; words_per_frame].into_boxed_slice(),
            };
            if free.push(storage).is_err() {
                return Err(PoolError::InvalidConfig("free list rejected a buffer".into()));
            }
        }

        let in_use = (0..config.buffer_count)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let generations = (0..config.buffer_count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::debug!(
            "Allocated {} frame buffers of {} bytes ({}x{} {:?})",
            config.buffer_count,
            config.frame_bytes,
            config.width,
            config.height,
            config.format
        );

        Ok(FrameBufferPool {
            shared: Arc::new(PoolShared {
                free,
                in_use,
                generations,
                geometry: config.geometry(),
                frame_bytes: config.frame_bytes,
            }),
        })
    }

    /// Take a free buffer without blocking.
    ///
    /// Fails with [`PoolError::Exhausted`] when every buffer is leased.
    pub fn acquire(&self) -> Result<FrameBuffer, PoolError> {
        let storage = self.shared.free.pop().ok_or(PoolError::Exhausted {
            capacity: self.capacity(),
        })?;

        let slot = storage.slot;
        let was_in_use = self.shared.in_use[slot].swap(true, Ordering::AcqRel);
        debug_assert!(!was_in_use, "free list held a leased slot");

        Ok(FrameBuffer {
            lease: Lease {
                storage: Some(storage),
                generation: self.shared.generations[slot].load(Ordering::Relaxed),
                shared: Arc::clone(&self.shared),
            },
        })
    }

    /// Return a buffer or frame to the pool.
    ///
    /// A buffer leased from a different pool is reported as
    /// [`PoolError::InvalidRelease`]; it is still returned to its own pool.
    pub fn release<T: Into<Lease>>(&self, item: T) -> Result<(), PoolError> {
        let mut lease = item.into();
        if !Arc::ptr_eq(&lease.shared, &self.shared) {
            return Err(PoolError::InvalidRelease("buffer belongs to a different pool"));
        }
        lease.give_back()
    }

    pub fn capacity(&self) -> usize {
        self.shared.in_use.len()
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.shared.geometry
    }

    pub fn frame_bytes(&self) -> usize {
        self.shared.frame_bytes
    }

    /// Whether `slot` is currently leased
    pub fn is_in_use(&self, slot: usize) -> bool {
        self.shared
            .in_use
            .get(slot)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let in_use = self
            .shared
            .in_use
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count();

        PoolStats {
            capacity: self.capacity(),
            in_use,
            available: self.capacity() - in_use,
        }
    }
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("geometry", &self.shared.geometry)
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn stamp(sequence: u64) -> FrameStamp {
        let now = Instant::now();
        FrameStamp {
            sequence,
            trigger_at: now,
            captured_at: now,
        }
    }

    #[test]
    fn test_frame_pool_acquire_release() {
        let pool = FrameBufferPool::new(PoolConfig::new(640, 480, PixelFormat::Mono16).with_buffer_count(4)).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.available, 4);

        let frame1 = pool.acquire().unwrap();
        assert_eq!(pool.stats().in_use, 1);

        let frame2 = pool.acquire().unwrap();
        assert_eq!(pool.stats().in_use, 2);

        pool.release(frame1).unwrap();
        assert_eq!(pool.stats().in_use, 1);

        pool.release(frame2.seal(stamp(0))).unwrap();
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_frame_pool_exhaustion() {
        let pool = FrameBufferPool::new(PoolConfig::new(64, 64, PixelFormat::Mono8)).unwrap();

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        let slots: HashSet<_> = held.iter().map(|b| b.slot()).collect();
        assert_eq!(slots.len(), 3, "each lease must hold a distinct slot");

        let extra = pool.acquire();
        assert_eq!(extra.unwrap_err(), PoolError::Exhausted { capacity: 3 });
        assert_eq!(pool.stats().available, 0);

        drop(held);
        assert_eq!(pool.stats().available, 3);
    }

    #[test]
    fn test_reacquired_buffer_has_no_residual_ownership() {
        let pool = FrameBufferPool::new(PoolConfig::new(32, 32, PixelFormat::Mono8).with_buffer_count(2)).unwrap();

        let mut buffer = pool.acquire().unwrap();
        let slot = buffer.slot();
        buffer.pixels_mut().fill(0xAB);
        let frame = buffer.seal(stamp(7));
        assert_eq!(frame.sequence(), 7);
        assert!(pool.is_in_use(slot));

        pool.release(frame).unwrap();
        assert!(!pool.is_in_use(slot));

        // Drain the other slot so the released one comes back
        let other = pool.acquire().unwrap();
        let again = pool.acquire().unwrap();
        assert_eq!(again.slot(), slot);
        assert_eq!(again.generation(), 1);
        assert!(pool.is_in_use(slot));
        assert_eq!(pool.stats().in_use, 2);
        drop(other);
    }

    #[test]
    fn test_release_into_foreign_pool_is_rejected() {
        let config = PoolConfig::new(16, 16, PixelFormat::Mono8);
        let pool_a = FrameBufferPool::new(config).unwrap();
        let pool_b = FrameBufferPool::new(config).unwrap();

        let buffer = pool_a.acquire().unwrap();
        let err = pool_b.release(buffer).unwrap_err();
        assert!(matches!(err, PoolError::InvalidRelease(_)));

        // The lease still went home
        assert_eq!(pool_a.stats().in_use, 0);
        assert_eq!(pool_b.stats().in_use, 0);
    }

    #[test]
    fn test_dropped_frame_returns_to_pool() {
        let pool = FrameBufferPool::new(PoolConfig::new(16, 16, PixelFormat::Mono8)).unwrap();
        {
            let _frame = pool.acquire().unwrap().seal(stamp(1));
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_pool_config_validation() {
        let too_small = PoolConfig::new(64, 64, PixelFormat::Mono8).with_buffer_count(1);
        assert!(matches!(
            FrameBufferPool::new(too_small),
            Err(PoolError::InvalidConfig(_))
        ));

        let mut short = PoolConfig::new(64, 64, PixelFormat::Mono16);
        short.frame_bytes = 64 * 64;
        assert!(short.validate().is_err());

        let zero = PoolConfig::new(0, 64, PixelFormat::Mono8);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_frame_rows_and_intensity() {
        let pool = FrameBufferPool::new(PoolConfig::new(4, 2, PixelFormat::Mono16)).unwrap();
        let mut buffer = pool.acquire().unwrap();
        {
            let px = buffer.pixels_mut();
            // pixel (1, 1) = 0x1234
            let index = (4 + 1) * 2;
            px[index] = 0x34;
            px[index + 1] = 0x12;
        }
        let frame = buffer.seal(stamp(0));
        assert_eq!(frame.row(1).len(), 8);
        assert_eq!(frame.intensity(1, 1), 0x1234);
        assert_eq!(frame.intensity(0, 0), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_shares_a_slot() {
        let pool = FrameBufferPool::new(PoolConfig::new(8, 8, PixelFormat::Mono8).with_buffer_count(4)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..500 {
                        if let Ok(mut buffer) = pool.acquire() {
                            let slot = buffer.slot() as u8;
                            buffer.pixels_mut().fill(slot);
                            std::thread::yield_now();
                            assert!(buffer.pixels().iter().all(|&b| b == slot));
                            seen.push(slot);
                        }
                    }
                    seen.len()
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.stats().in_use, 0);
    }
}
