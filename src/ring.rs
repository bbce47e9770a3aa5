//! Lock-free SPSC ring of word-sized handles in shared memory
//!
//! # Design
//! - Fixed power-of-two slot count, index wrap by mask
//! - Monotonic 64-bit write/read cursors, each on its own cache line
//! - Producer: check space -> write slots -> publish write cursor (Release)
//! - Consumer: observe write cursor (Acquire) -> read slot -> publish read cursor
//!
//! Exactly one process enqueues and one process dequeues per ring. The
//! direction is fixed by converting a [`Ring`] into a [`RingProducer`] or
//! a [`RingConsumer`]; both take `&mut self`, so a cursor has one writer.

use crate::error::{LinkError, Result};
use crate::registry::RegionRegistry;
use crate::shm::SharedRegion;
use crate::wait::WaitPolicy;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Bytes per slot: one opaque buffer handle
pub const SLOT_SIZE: usize = std::mem::size_of::<u64>();

const RING_MAGIC: u32 = 0x524E_4746; // "RNGF"

/// Padding to cache line
#[repr(C, align(64))]
pub(crate) struct CachePadded<T>(pub(crate) T);

/// Ring header at the start of its region; slots follow immediately
#[repr(C)]
struct RingHeader {
    /// Producer cursor (total slots ever written)
    write: CachePadded<AtomicU64>,
    /// Consumer cursor (total slots ever read)
    read: CachePadded<AtomicU64>,
    /// Set last during init; peers refuse to attach before it is visible
    magic: AtomicU32,
    capacity: u32,
    elem_size: u32,
    /// Producer-side occupancy limit, `capacity` when unset
    watermark: AtomicU32,
}

fn check_capacity(capacity: u32) -> Result<()> {
    if !capacity.is_power_of_two() {
        return Err(LinkError::Config(format!(
            "ring capacity {capacity} is not a power of two"
        )));
    }
    Ok(())
}

/// A ring laid over a named shared region
pub struct Ring {
    region: SharedRegion,
    header: NonNull<RingHeader>,
    slots: NonNull<AtomicU64>,
    mask: u64,
    capacity: u32,
}

// SAFETY: all shared state is reached through atomics; the role handles
// enforce single producer / single consumer.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Size of the region needed for `capacity` slots
    pub const fn region_size(capacity: u32) -> usize {
        std::mem::size_of::<RingHeader>() + capacity as usize * SLOT_SIZE
    }

    /// Reserve a region under `name` and initialize an empty ring in it.
    ///
    /// Fails with [`LinkError::Config`] before reserving anything when
    /// `capacity` is not a power of two or `slot_size` is not [`SLOT_SIZE`].
    pub fn create(
        registry: &dyn RegionRegistry,
        name: &str,
        capacity: u32,
        slot_size: usize,
    ) -> Result<Self> {
        check_capacity(capacity)?;
        if slot_size != SLOT_SIZE {
            return Err(LinkError::Config(format!(
                "ring slot size must be {SLOT_SIZE} bytes, got {slot_size}"
            )));
        }

        let region = registry.reserve(name, Self::region_size(capacity))?;
        Self::init_in(region, capacity)
    }

    /// Initialize an empty ring over an already reserved region
    pub fn init_in(region: SharedRegion, capacity: u32) -> Result<Self> {
        check_capacity(capacity)?;
        let needed = Self::region_size(capacity);
        if region.size() < needed {
            return Err(LinkError::Config(format!(
                "region '{}' holds {} bytes, ring of {} slots needs {}",
                region.name(),
                region.size(),
                capacity,
                needed
            )));
        }

        let header = region.as_ptr() as *mut RingHeader;
        // SAFETY: region is 64-byte aligned and large enough for the header;
        // nobody attaches until the magic store below.
        unsafe {
            (*header).write.0.store(0, Ordering::Relaxed);
            (*header).read.0.store(0, Ordering::Relaxed);
            std::ptr::addr_of_mut!((*header).capacity).write(capacity);
            std::ptr::addr_of_mut!((*header).elem_size).write(SLOT_SIZE as u32);
            (*header).watermark.store(capacity, Ordering::Relaxed);
            (*header).magic.store(RING_MAGIC, Ordering::Release);
        }

        tracing::info!(ring = region.name(), capacity, "created ring");
        Self::from_region(region)
    }

    /// Attach to a ring created by a peer
    pub fn attach(registry: &dyn RegionRegistry, name: &str) -> Result<Self> {
        let region = registry.lookup(name)?;
        let ring = Self::from_region(region)?;
        tracing::debug!(ring = name, capacity = ring.capacity, "attached ring");
        Ok(ring)
    }

    fn from_region(region: SharedRegion) -> Result<Self> {
        if region.size() < std::mem::size_of::<RingHeader>() {
            return Err(LinkError::Config(format!(
                "region '{}' is too small for a ring header",
                region.name()
            )));
        }

        let header = region.as_ptr() as *mut RingHeader;
        // SAFETY: region holds at least a header
        let (magic, capacity, elem_size) = unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            (magic, (*header).capacity, (*header).elem_size)
        };

        if magic != RING_MAGIC {
            return Err(LinkError::InvalidMagic {
                name: region.name().to_string(),
                expected: RING_MAGIC,
                got: magic,
            });
        }
        check_capacity(capacity)?;
        if elem_size as usize != SLOT_SIZE {
            return Err(LinkError::Config(format!(
                "ring '{}' has {elem_size}-byte slots",
                region.name()
            )));
        }
        if region.size() < Self::region_size(capacity) {
            return Err(LinkError::Config(format!(
                "ring '{}' is truncated",
                region.name()
            )));
        }

        // SAFETY: slots start right after the header, inside the region
        let slots = unsafe { region.as_ptr().add(std::mem::size_of::<RingHeader>()) };

        Ok(Self {
            header: NonNull::new(header).ok_or_else(|| {
                LinkError::Config(format!("region '{}' has a null base", region.name()))
            })?,
            slots: NonNull::new(slots as *mut AtomicU64).ok_or_else(|| {
                LinkError::Config(format!("region '{}' has a null base", region.name()))
            })?,
            mask: capacity as u64 - 1,
            capacity,
            region,
        })
    }

    #[inline(always)]
    fn header(&self) -> &RingHeader {
        // SAFETY: validated in from_region, lives as long as the region
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    fn slot(&self, cursor: u64) -> &AtomicU64 {
        // SAFETY: masked index < capacity
        unsafe { &*self.slots.as_ptr().add((cursor & self.mask) as usize) }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of occupied slots
    #[inline]
    pub fn len(&self) -> usize {
        let header = self.header();
        let read = header.read.0.load(Ordering::Acquire);
        let write = header.write.0.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots a producer could fill right now
    #[inline]
    pub fn free_count(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.len())
    }

    pub fn watermark(&self) -> u32 {
        self.header().watermark.load(Ordering::Relaxed)
    }

    /// Cap producer occupancy below raw capacity.
    ///
    /// A burst that would leave more than `watermark` slots occupied is
    /// rejected whole with [`LinkError::QuotaExceeded`].
    pub fn set_watermark(&self, watermark: u32) -> Result<()> {
        if watermark == 0 || watermark > self.capacity {
            return Err(LinkError::InvalidArgument(format!(
                "watermark {watermark} outside 1..={}",
                self.capacity
            )));
        }
        self.header().watermark.store(watermark, Ordering::Relaxed);
        Ok(())
    }

    /// Become the single producer of this ring
    pub fn into_producer(self) -> RingProducer {
        RingProducer { ring: self }
    }

    /// Become the single consumer of this ring
    pub fn into_consumer(self) -> RingConsumer {
        RingConsumer { ring: self }
    }
}

/// Enqueue side of a ring
pub struct RingProducer {
    ring: Ring,
}

impl RingProducer {
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Commit all of `items` or none of them.
    ///
    /// Fails with [`LinkError::NoSpace`] when fewer than `items.len()` slots
    /// are free and with [`LinkError::QuotaExceeded`] when the burst would
    /// cross the watermark. The consumer never observes part of a burst.
    pub fn enqueue_bulk(&mut self, items: &[u64]) -> Result<()> {
        let n = items.len();
        if n == 0 {
            return Ok(());
        }

        let ring = &self.ring;
        let header = ring.header();
        let write = header.write.0.load(Ordering::Relaxed);
        let read = header.read.0.load(Ordering::Acquire);
        let used = write.wrapping_sub(read) as usize;
        let free = (ring.capacity as usize).saturating_sub(used);

        if n > free {
            tracing::debug!(ring = ring.name(), requested = n, free, "ring full");
            return Err(LinkError::NoSpace { requested: n, free });
        }

        let watermark = header.watermark.load(Ordering::Relaxed);
        if used + n > watermark as usize {
            tracing::debug!(ring = ring.name(), watermark, occupancy = used + n, "ring over quota");
            return Err(LinkError::QuotaExceeded {
                watermark,
                occupancy: used + n,
            });
        }

        for (i, &item) in items.iter().enumerate() {
            ring.slot(write.wrapping_add(i as u64))
                .store(item, Ordering::Relaxed);
        }

        // Publish the whole burst at once
        header
            .write
            .0
            .store(write.wrapping_add(n as u64), Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn enqueue(&mut self, item: u64) -> Result<()> {
        self.enqueue_bulk(std::slice::from_ref(&item))
    }
}

/// Dequeue side of a ring
pub struct RingConsumer {
    ring: Ring,
}

impl RingConsumer {
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Pop one handle if available, `None` when the ring is empty
    #[inline]
    pub fn try_dequeue(&mut self) -> Option<u64> {
        let ring = &self.ring;
        let header = ring.header();
        let read = header.read.0.load(Ordering::Relaxed);
        let write = header.write.0.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        let item = ring.slot(read).load(Ordering::Relaxed);
        header.read.0.store(read.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Pop one handle, spinning until one is available
    #[inline]
    pub fn dequeue(&mut self) -> u64 {
        loop {
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            core::hint::spin_loop();
        }
    }

    /// Pop one handle, spinning no longer than `wait` allows
    pub fn dequeue_with(&mut self, wait: &WaitPolicy) -> Result<u64> {
        wait.spin_until(|| self.try_dequeue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use crate::wait::CancelToken;
    use std::thread;
    use std::time::Duration;

    fn pair(registry: &LocalRegistry, name: &str, capacity: u32) -> (RingProducer, RingConsumer) {
        let producer = Ring::create(registry, name, capacity, SLOT_SIZE)
            .unwrap()
            .into_producer();
        let consumer = Ring::attach(registry, name).unwrap().into_consumer();
        (producer, consumer)
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let registry = LocalRegistry::new();
        for capacity in [0, 3, 6, 1000, 1023] {
            assert!(matches!(
                Ring::create(&registry, "bad", capacity, SLOT_SIZE),
                Err(LinkError::Config(_))
            ));
        }
        // Nothing was reserved
        assert_eq!(registry.live_regions(), 0);
    }

    #[test]
    fn test_rejects_wrong_slot_size() {
        let registry = LocalRegistry::new();
        assert!(matches!(
            Ring::create(&registry, "wide", 16, 16),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_fifo_order() {
        let registry = LocalRegistry::new();
        let (mut tx, mut rx) = pair(&registry, "fifo", 8);

        tx.enqueue_bulk(&[10, 11, 12]).unwrap();
        tx.enqueue(13).unwrap();
        assert_eq!(rx.ring().len(), 4);

        assert_eq!(rx.try_dequeue(), Some(10));
        assert_eq!(rx.try_dequeue(), Some(11));
        assert_eq!(rx.try_dequeue(), Some(12));
        assert_eq!(rx.try_dequeue(), Some(13));
        assert_eq!(rx.try_dequeue(), None);
    }

    #[test]
    fn test_bulk_enqueue_is_all_or_nothing() {
        let registry = LocalRegistry::new();
        let (mut tx, mut rx) = pair(&registry, "bulk", 4);

        tx.enqueue_bulk(&[1, 2, 3]).unwrap();
        let err = tx.enqueue_bulk(&[4, 5]).unwrap_err();
        assert!(matches!(err, LinkError::NoSpace { requested: 2, free: 1 }));
        assert_eq!(tx.ring().len(), 3);

        tx.enqueue(4).unwrap();
        assert_eq!(tx.ring().free_count(), 0);
        for expected in 1..=4 {
            assert_eq!(rx.try_dequeue(), Some(expected));
        }
    }

    #[test]
    fn test_watermark_quota() {
        let registry = LocalRegistry::new();
        let (mut tx, _rx) = pair(&registry, "quota", 8);
        tx.ring().set_watermark(4).unwrap();

        tx.enqueue_bulk(&[1, 2, 3]).unwrap();
        let err = tx.enqueue_bulk(&[4, 5]).unwrap_err();
        assert!(matches!(
            err,
            LinkError::QuotaExceeded { watermark: 4, occupancy: 5 }
        ));
        assert_eq!(tx.ring().len(), 3);

        assert!(tx.ring().set_watermark(0).is_err());
        assert!(tx.ring().set_watermark(9).is_err());
    }

    #[test]
    fn test_wraparound() {
        let registry = LocalRegistry::new();
        let (mut tx, mut rx) = pair(&registry, "wrap", 4);

        for round in 0..100u64 {
            tx.enqueue_bulk(&[round * 3, round * 3 + 1, round * 3 + 2])
                .unwrap();
            assert_eq!(rx.try_dequeue(), Some(round * 3));
            assert_eq!(rx.try_dequeue(), Some(round * 3 + 1));
            assert_eq!(rx.try_dequeue(), Some(round * 3 + 2));
        }
        assert!(rx.ring().is_empty());
    }

    #[test]
    fn test_attach_missing() {
        let registry = LocalRegistry::new();
        assert!(matches!(
            Ring::attach(&registry, "nobody"),
            Err(LinkError::NotFound { .. })
        ));
    }

    #[test]
    fn test_attach_rejects_foreign_region() {
        let registry = LocalRegistry::new();
        let _raw = registry.reserve("raw", 4096).unwrap();
        assert!(matches!(
            Ring::attach(&registry, "raw"),
            Err(LinkError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_init_in_too_small_region() {
        let registry = LocalRegistry::new();
        let region = registry.reserve("small", 64).unwrap();
        assert!(matches!(
            Ring::init_in(region, 1024),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_blocking_dequeue_across_threads() {
        let registry = LocalRegistry::new();
        let (mut tx, mut rx) = pair(&registry, "spin", 16);

        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..64 {
                seen.push(rx.dequeue());
            }
            seen
        });

        let mut next = 0u64;
        while next < 64 {
            if tx.enqueue(next).is_ok() {
                next += 1;
            } else {
                thread::yield_now();
            }
        }

        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_dequeue_with_timeout_and_cancel() {
        let registry = LocalRegistry::new();
        let (_tx, mut rx) = pair(&registry, "idle", 4);

        let wait = WaitPolicy::forever().with_timeout(Duration::from_millis(5));
        assert!(matches!(rx.dequeue_with(&wait), Err(LinkError::TimedOut)));

        let token = CancelToken::new();
        token.cancel();
        let wait = WaitPolicy::forever().with_cancel(token);
        assert!(matches!(rx.dequeue_with(&wait), Err(LinkError::Cancelled)));
    }
}
