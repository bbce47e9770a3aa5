//! Named shared memory regions
//!
//! A [`SharedRegion`] is one fixed-size mapping that rings and pools lay
//! their structures over. It is backed either by a POSIX shared memory
//! object (visible to other processes) or by a process-local heap block
//! handed out by [`LocalRegistry`](crate::registry::LocalRegistry).

use crate::error::{LinkError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{flock, ftruncate, FlockOperation};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::alloc::Layout;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment of every region base address
pub(crate) const REGION_ALIGN: usize = 64;

enum Backing {
    Posix {
        #[allow(dead_code)]
        fd: OwnedFd,
        full_name: String,
        is_owner: bool,
    },
    Local(#[allow(dead_code)] Arc<LocalBlock>),
}

/// Handle to a mapped shared region
pub struct SharedRegion {
    addr: NonNull<u8>,
    size: usize,
    name: String,
    backing: Backing,
}

// SAFETY: the region is plain memory; everything laid over it synchronizes
// through atomics in the shared headers.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn c_name(full_name: &str) -> Result<CString> {
    CString::new(full_name)
        .map_err(|_| LinkError::InvalidArgument(format!("region name '{full_name}' contains NUL")))
}

impl SharedRegion {
    /// Create a POSIX shared memory object and map it, reclaiming a stale one
    pub(crate) fn create_posix(full_name: &str, name: &str, size: usize) -> Result<Self> {
        let c_name = c_name(full_name)?;

        let unavailable = |e: rustix::io::Errno| LinkError::RegionUnavailable {
            name: name.to_string(),
            source: e.into(),
        };

        // Try to create exclusively first, fall back to open if a stale object exists
        let fd = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        ) {
            Ok(fd) => fd,
            Err(_) => {
                shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(unavailable)?
            }
        };

        // The owner holds an exclusive lock for its whole lifetime; an object
        // whose lock is free was abandoned and may be reclaimed.
        flock(&fd, FlockOperation::NonBlockingLockExclusive).map_err(|e| {
            tracing::warn!(region = name, error = %e, "region is owned by a live process");
            unavailable(e)
        })?;

        ftruncate(&fd, size as u64).map_err(|e| LinkError::Truncate(e.into()))?;

        let addr = map_fd(&fd, size)?;

        // SAFETY: freshly mapped, `size` bytes writable
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            addr,
            size,
            name: name.to_string(),
            backing: Backing::Posix {
                fd,
                full_name: full_name.to_string(),
                is_owner: true,
            },
        })
    }

    /// Open an existing POSIX shared memory object
    pub(crate) fn open_posix(full_name: &str, name: &str) -> Result<Self> {
        let c_name = c_name(full_name)?;

        let not_found = |e: rustix::io::Errno| LinkError::NotFound {
            name: name.to_string(),
            source: e.into(),
        };

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(not_found)?;
        let stat = rustix::fs::fstat(&fd).map_err(not_found)?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(LinkError::NotFound {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "region has zero size"),
            });
        }

        let addr = map_fd(&fd, size)?;

        Ok(Self {
            addr,
            size,
            name: name.to_string(),
            backing: Backing::Posix {
                fd,
                full_name: full_name.to_string(),
                is_owner: false,
            },
        })
    }

    /// Wrap a process-local block
    pub(crate) fn from_local(name: &str, block: Arc<LocalBlock>) -> Self {
        Self {
            addr: block.addr,
            size: block.layout.size(),
            name: name.to_string(),
            backing: Backing::Local(block),
        }
    }

    /// Get raw pointer to the start of the region
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the region in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the registry name of the region
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle unlinks the region when dropped
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        match &self.backing {
            Backing::Posix { is_owner, .. } => *is_owner,
            Backing::Local(_) => false,
        }
    }
}

fn map_fd(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of an fd we own; no existing memory is touched
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| LinkError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| LinkError::Mmap(io::Error::new(io::ErrorKind::Other, "mmap returned null")))
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Posix {
            full_name,
            is_owner,
            ..
        } = &self.backing
        {
            // SAFETY: we mapped exactly `size` bytes at `addr`
            if let Err(e) = unsafe { munmap(self.addr.as_ptr().cast(), self.size) } {
                tracing::error!(error = %e, region = %self.name, "munmap failed for shared region");
            }

            if *is_owner {
                match shm_unlink(full_name.as_str()) {
                    Ok(()) => tracing::debug!(region = %self.name, "unlinked shared region"),
                    Err(e) => {
                        tracing::warn!(error = %e, region = %self.name, "shm_unlink failed for shared region")
                    }
                }
            }
        }
    }
}

/// Zeroed, cache-line aligned heap block standing in for a shared object
pub(crate) struct LocalBlock {
    addr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: same contract as SharedRegion
unsafe impl Send for LocalBlock {}
unsafe impl Sync for LocalBlock {}

impl LocalBlock {
    pub(crate) fn zeroed(name: &str, size: usize) -> Result<Self> {
        let unavailable = |msg: &str| LinkError::RegionUnavailable {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()),
        };

        if size == 0 {
            return Err(unavailable("zero-sized region"));
        }
        let layout =
            Layout::from_size_align(size, REGION_ALIGN).map_err(|_| unavailable("bad layout"))?;

        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let addr = NonNull::new(ptr).ok_or_else(|| LinkError::RegionUnavailable {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"),
        })?;

        Ok(Self { addr, layout })
    }
}

impl Drop for LocalBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout
        unsafe {
            std::alloc::dealloc(self.addr.as_ptr(), self.layout);
        }
    }
}
