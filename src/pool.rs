//! Pool of fixed-size transfer buffers in shared memory
//!
//! Every message on the link travels in one pool buffer. Rings only carry
//! a buffer's index, so the pool lives in its own named region and both
//! peers resolve indices against their own mapping of it.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  PoolHeader (free-list head, counters)        │
//! ├──────────────────────────────────────────────┤
//! │  BufMeta × count (free-list link, used len)   │
//! ├──────────────────────────────────────────────┤
//! │  Buffer data × count (buf_size each)          │
//! └──────────────────────────────────────────────┘
//! ```

use crate::error::{LinkError, Result};
use crate::registry::RegionRegistry;
use crate::ring::CachePadded;
use crate::shm::SharedRegion;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const POOL_MAGIC: u32 = 0x504B_5450; // "PKTP"

/// End of the free list
const NIL: u32 = u32::MAX;

const CACHE_LINE_SIZE: usize = 64;

#[repr(C)]
struct PoolHeader {
    /// Free-list head: index (low 32 bits) + tag (high 32 bits) against ABA
    free_head: CachePadded<AtomicU64>,
    available: CachePadded<AtomicU32>,
    magic: AtomicU32,
    buf_count: u32,
    buf_size: u32,
}

#[repr(C)]
struct BufMeta {
    next: AtomicU32,
    /// Bytes the current owner filled in, read by the receiving peer
    data_len: AtomicU32,
}

#[inline(always)]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline(always)]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

const fn align_up(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

const fn data_offset(buf_count: u32) -> usize {
    align_up(
        std::mem::size_of::<PoolHeader>() + buf_count as usize * std::mem::size_of::<BufMeta>(),
    )
}

/// Index of a pool buffer, the value rings carry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufHandle(u32);

impl BufHandle {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0 as u64
    }
}

/// A named pool of transfer buffers
pub struct BufferPool {
    region: SharedRegion,
    header: NonNull<PoolHeader>,
    meta: NonNull<BufMeta>,
    data: NonNull<u8>,
    buf_count: u32,
    buf_size: u32,
}

// SAFETY: the free list is lock-free over atomics; buffer contents are only
// touched by the single owner of a checked-out buffer.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Size of the region needed for `buf_count` buffers of `buf_size` bytes
    pub fn region_size(buf_count: u32, buf_size: u32) -> Option<usize> {
        (buf_count as usize)
            .checked_mul(buf_size as usize)?
            .checked_add(data_offset(buf_count))
    }

    /// Reserve a region under `name` and fill it with free buffers
    pub fn create(
        registry: &dyn RegionRegistry,
        name: &str,
        buf_count: u32,
        buf_size: u32,
    ) -> Result<Self> {
        if buf_count == 0 || buf_count == NIL {
            return Err(LinkError::Config(format!(
                "pool '{name}' buffer count {buf_count} out of range"
            )));
        }
        if buf_size == 0 {
            return Err(LinkError::Config(format!(
                "pool '{name}' buffer size must be positive"
            )));
        }
        let size = Self::region_size(buf_count, buf_size).ok_or_else(|| {
            LinkError::Config(format!("pool '{name}' of {buf_count}x{buf_size} overflows"))
        })?;

        let region = registry.reserve(name, size)?;
        let header = region.as_ptr() as *mut PoolHeader;

        // SAFETY: region is aligned, zeroed and sized for header + meta + data;
        // peers do not attach before the magic store.
        unsafe {
            std::ptr::addr_of_mut!((*header).buf_count).write(buf_count);
            std::ptr::addr_of_mut!((*header).buf_size).write(buf_size);

            let meta = region.as_ptr().add(std::mem::size_of::<PoolHeader>()) as *mut BufMeta;
            for i in 0..buf_count {
                let next = if i + 1 == buf_count { NIL } else { i + 1 };
                (*meta.add(i as usize)).next.store(next, Ordering::Relaxed);
                (*meta.add(i as usize)).data_len.store(0, Ordering::Relaxed);
            }

            (*header).free_head.0.store(pack(0, 0), Ordering::Relaxed);
            (*header).available.0.store(buf_count, Ordering::Relaxed);
            (*header).magic.store(POOL_MAGIC, Ordering::Release);
        }

        tracing::info!(pool = name, buf_count, buf_size, "created buffer pool");
        Self::from_region(region)
    }

    /// Attach to a pool created by a peer
    pub fn attach(registry: &dyn RegionRegistry, name: &str) -> Result<Self> {
        let region = registry.lookup(name)?;
        let pool = Self::from_region(region)?;
        tracing::debug!(pool = name, buf_count = pool.buf_count, "attached buffer pool");
        Ok(pool)
    }

    fn from_region(region: SharedRegion) -> Result<Self> {
        if region.size() < std::mem::size_of::<PoolHeader>() {
            return Err(LinkError::Config(format!(
                "region '{}' is too small for a pool header",
                region.name()
            )));
        }

        let header = region.as_ptr() as *mut PoolHeader;
        // SAFETY: region holds at least a header
        let (magic, buf_count, buf_size) = unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            (magic, (*header).buf_count, (*header).buf_size)
        };

        if magic != POOL_MAGIC {
            return Err(LinkError::InvalidMagic {
                name: region.name().to_string(),
                expected: POOL_MAGIC,
                got: magic,
            });
        }
        match Self::region_size(buf_count, buf_size) {
            Some(size) if size <= region.size() => {}
            _ => {
                return Err(LinkError::Config(format!(
                    "pool '{}' is truncated",
                    region.name()
                )))
            }
        }

        let base = region.as_ptr();
        let null = || LinkError::Config(format!("region '{}' has a null base", region.name()));
        // SAFETY: offsets stay inside the validated region
        let (meta, data) = unsafe {
            (
                base.add(std::mem::size_of::<PoolHeader>()) as *mut BufMeta,
                base.add(data_offset(buf_count)),
            )
        };

        Ok(Self {
            header: NonNull::new(header).ok_or_else(null)?,
            meta: NonNull::new(meta).ok_or_else(null)?,
            data: NonNull::new(data).ok_or_else(null)?,
            buf_count,
            buf_size,
            region,
        })
    }

    #[inline(always)]
    fn header(&self) -> &PoolHeader {
        // SAFETY: validated in from_region
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    fn meta(&self, index: u32) -> &BufMeta {
        debug_assert!(index < self.buf_count);
        // SAFETY: callers pass index < buf_count
        unsafe { &*self.meta.as_ptr().add(index as usize) }
    }

    #[inline(always)]
    fn data_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.buf_count);
        // SAFETY: callers pass index < buf_count
        unsafe {
            self.data
                .as_ptr()
                .add(index as usize * self.buf_size as usize)
        }
    }

    fn pop_free(&self) -> Option<u32> {
        let header = self.header();
        let mut head = header.free_head.0.load(Ordering::Acquire);

        loop {
            let (tag, index) = unpack(head);
            if index == NIL || index >= self.buf_count {
                return None;
            }

            let next = self.meta(index).next.load(Ordering::Acquire);
            match header.free_head.0.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    header.available.0.fetch_sub(1, Ordering::Relaxed);
                    return Some(index);
                }
                Err(actual) => head = actual,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let header = self.header();
        let meta = self.meta(index);
        // Count first so a racing pop never drives the counter below zero
        header.available.0.fetch_add(1, Ordering::Relaxed);
        let mut head = header.free_head.0.load(Ordering::Acquire);

        loop {
            let (tag, top) = unpack(head);
            meta.next.store(top, Ordering::Relaxed);
            match header.free_head.0.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Take one buffer out of the pool.
    ///
    /// Never waits: an empty pool fails with [`LinkError::OutOfBuffers`].
    pub fn checkout(&self) -> Result<TransferBuf<'_>> {
        let index = self.pop_free().ok_or(LinkError::OutOfBuffers)?;
        self.meta(index).data_len.store(0, Ordering::Relaxed);
        Ok(TransferBuf { pool: self, index })
    }

    /// Return a buffer whose ownership was handed out with
    /// [`TransferBuf::into_handle`].
    ///
    /// # Safety
    /// The caller must own `handle`: it was not released before and no
    /// other process or guard still uses it.
    pub unsafe fn release(&self, handle: BufHandle) {
        if handle.0 >= self.buf_count {
            tracing::error!(pool = self.name(), handle = handle.0, "release of foreign handle ignored");
            return;
        }
        self.push_free(handle.0);
    }

    /// Adopt a raw handle received from a ring.
    ///
    /// # Safety
    /// `raw` must have been enqueued by the peer that owned the buffer and
    /// dequeued exactly once; ownership moves to the returned guard.
    pub unsafe fn claim(&self, raw: u64) -> Result<TransferBuf<'_>> {
        if raw >= self.buf_count as u64 {
            return Err(LinkError::InvalidHandle(raw));
        }
        Ok(TransferBuf {
            pool: self,
            index: raw as u32,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Buffers currently free
    pub fn available(&self) -> usize {
        self.header().available.0.load(Ordering::Relaxed) as usize
    }

    pub fn buffer_count(&self) -> usize {
        self.buf_count as usize
    }

    /// Physical capacity of each buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.buf_size as usize
    }
}

/// Exclusive ownership of one pool buffer.
///
/// Dropping the guard returns the buffer to the pool. Handing it to a ring
/// goes through [`TransferBuf::into_handle`], after which this process must
/// not touch the buffer again.
pub struct TransferBuf<'a> {
    pool: &'a BufferPool,
    index: u32,
}

impl<'a> TransferBuf<'a> {
    #[inline]
    pub fn handle(&self) -> BufHandle {
        BufHandle(self.index)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.buf_size as usize
    }

    /// Used length recorded for the receiver
    #[inline]
    pub fn len(&self) -> usize {
        (self.pool.meta(self.index).data_len.load(Ordering::Relaxed) as usize).min(self.capacity())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record how many bytes of the buffer are meaningful
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(LinkError::PayloadTooLarge {
                max: self.capacity(),
                got: len,
            });
        }
        self.pool
            .meta(self.index)
            .data_len
            .store(len as u32, Ordering::Relaxed);
        Ok(())
    }

    /// The used bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: this guard owns the buffer; len <= capacity
        unsafe { std::slice::from_raw_parts(self.pool.data_ptr(self.index), self.len()) }
    }

    /// The whole physical buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: this guard owns the buffer exclusively
        unsafe { std::slice::from_raw_parts_mut(self.pool.data_ptr(self.index), self.capacity()) }
    }

    /// Give up ownership without releasing the buffer
    pub fn into_handle(self) -> BufHandle {
        let handle = self.handle();
        std::mem::forget(self);
        handle
    }
}

impl Drop for TransferBuf<'_> {
    fn drop(&mut self) {
        self.pool.push_free(self.index);
    }
}

impl fmt::Debug for TransferBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuf")
            .field("index", &self.index)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
