//! Named shared-region registries
//!
//! Rings and buffer pools never allocate memory themselves: they ask a
//! [`RegionRegistry`] to reserve a fixed-size region under a name, and
//! peers find the same region again by looking the name up.

use crate::error::{LinkError, Result};
use crate::shm::{LocalBlock, SharedRegion};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

/// Default prefix for POSIX shared memory object names
pub const DEFAULT_POSIX_PREFIX: &str = "/ringlink_";

/// POSIX limit on shared memory object names
const MAX_POSIX_NAME_LEN: usize = 255;

/// Reserve-by-name / lookup-by-name source of fixed-size regions
pub trait RegionRegistry: Send + Sync {
    /// Reserve a zeroed region of `size` bytes under `name`.
    ///
    /// Fails with [`LinkError::RegionUnavailable`] while another handle still
    /// owns the name. A stale region left behind by a dead owner is replaced.
    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion>;

    /// Map a region previously reserved under `name`
    fn lookup(&self, name: &str) -> Result<SharedRegion>;
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LinkError::InvalidArgument("empty region name".into()));
    }
    Ok(())
}

/// Registry backed by POSIX shared memory objects (`shm_open`)
#[derive(Clone, Debug)]
pub struct PosixRegistry {
    prefix: String,
}

impl PosixRegistry {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_POSIX_PREFIX)
    }

    /// Use a custom object-name prefix, e.g. to isolate two deployments
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_name(&self, name: &str) -> Result<String> {
        check_name(name)?;
        let max = MAX_POSIX_NAME_LEN.saturating_sub(self.prefix.len());
        if name.len() > max {
            return Err(LinkError::NameTooLong {
                max,
                got: name.len(),
            });
        }
        Ok(format!("{}{}", self.prefix, name))
    }
}

impl Default for PosixRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionRegistry for PosixRegistry {
    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion> {
        let full_name = self.full_name(name)?;
        if size == 0 {
            return Err(LinkError::InvalidArgument(format!(
                "region '{name}' must not be empty"
            )));
        }
        SharedRegion::create_posix(&full_name, name, size)
    }

    fn lookup(&self, name: &str) -> Result<SharedRegion> {
        let full_name = self.full_name(name)?;
        SharedRegion::open_posix(&full_name, name)
    }
}

/// Process-local registry.
///
/// Regions are heap blocks kept alive by the handles that map them, so
/// several independent transports can live in one process (tests, benches)
/// without touching `/dev/shm`.
#[derive(Default)]
pub struct LocalRegistry {
    regions: Mutex<HashMap<String, Weak<LocalBlock>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names currently backed by live regions
    pub fn live_regions(&self) -> usize {
        self.regions
            .lock()
            .values()
            .filter(|block| block.strong_count() > 0)
            .count()
    }
}

impl RegionRegistry for LocalRegistry {
    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion> {
        check_name(name)?;
        let mut regions = self.regions.lock();

        if regions.get(name).and_then(Weak::upgrade).is_some() {
            return Err(LinkError::RegionUnavailable {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "region is still mapped"),
            });
        }

        let block = Arc::new(LocalBlock::zeroed(name, size)?);
        regions.insert(name.to_string(), Arc::downgrade(&block));
        Ok(SharedRegion::from_local(name, block))
    }

    fn lookup(&self, name: &str) -> Result<SharedRegion> {
        check_name(name)?;
        let regions = self.regions.lock();
        regions
            .get(name)
            .and_then(Weak::upgrade)
            .map(|block| SharedRegion::from_local(name, block))
            .ok_or_else(|| LinkError::NotFound {
                name: name.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_reserve_and_lookup_share_memory() {
        let registry = LocalRegistry::new();
        let a = registry.reserve("shared", 128).unwrap();
        let b = registry.lookup("shared").unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(b.size(), 128);

        unsafe { *a.as_ptr().add(7) = 9 };
        assert_eq!(unsafe { *b.as_ptr().add(7) }, 9);
    }

    #[test]
    fn test_local_lookup_missing() {
        let registry = LocalRegistry::new();
        assert!(matches!(
            registry.lookup("absent"),
            Err(LinkError::NotFound { .. })
        ));
    }

    #[test]
    fn test_local_region_dies_with_last_handle() {
        let registry = LocalRegistry::new();
        let region = registry.reserve("transient", 64).unwrap();
        assert_eq!(registry.live_regions(), 1);
        drop(region);
        assert_eq!(registry.live_regions(), 0);
        assert!(registry.lookup("transient").is_err());
    }

    #[test]
    fn test_local_reserve_live_name_rejected() {
        let registry = LocalRegistry::new();
        let region = registry.reserve("fixed", 64).unwrap();
        unsafe { *region.as_ptr() = 7 };

        assert!(matches!(
            registry.reserve("fixed", 64),
            Err(LinkError::RegionUnavailable { .. })
        ));
        assert_eq!(unsafe { *region.as_ptr() }, 7);

        // A peer mapping keeps the name in use too
        let peer = registry.lookup("fixed").unwrap();
        drop(region);
        assert!(registry.reserve("fixed", 64).is_err());

        drop(peer);
        let fresh = registry.reserve("fixed", 128).unwrap();
        assert_eq!(fresh.size(), 128);
        assert_eq!(unsafe { *fresh.as_ptr() }, 0);
    }

    #[test]
    fn test_posix_name_checks() {
        let registry = PosixRegistry::new();
        assert!(matches!(
            registry.lookup(""),
            Err(LinkError::InvalidArgument(_))
        ));
        let long = "x".repeat(300);
        assert!(matches!(
            registry.reserve(&long, 64),
            Err(LinkError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_posix_reserve_and_lookup() {
        let registry = PosixRegistry::new();
        let name = format!("registry_test_{}", std::process::id());
        let owner = registry.reserve(&name, 4096).unwrap();
        let peer = registry.lookup(&name).unwrap();
        assert_eq!(peer.size(), 4096);
        assert!(owner.is_owner());
        assert!(!peer.is_owner());
    }

    #[test]
    fn test_posix_reserve_live_name_rejected() {
        let registry = PosixRegistry::with_prefix(format!("/ringlink_dup_{}_", std::process::id()));
        let owner = registry.reserve("region", 4096).unwrap();
        let peer = registry.lookup("region").unwrap();
        unsafe { *owner.as_ptr() = 0x5A };

        assert!(matches!(
            registry.reserve("region", 64),
            Err(LinkError::RegionUnavailable { .. })
        ));
        assert_eq!(peer.size(), 4096);
        assert_eq!(unsafe { *peer.as_ptr() }, 0x5A);

        drop(peer);
        drop(owner);
        let again = registry.reserve("region", 64).unwrap();
        assert_eq!(again.size(), 64);
    }

    #[test]
    fn test_posix_stale_object_reclaimed() {
        use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};

        let registry = PosixRegistry::with_prefix(format!("/ringlink_stale_{}_", std::process::id()));
        let full_name = format!("{}region", registry.prefix());

        // Left behind by an owner that died without unlinking
        let fd = shm_open(
            full_name.as_str(),
            ShmOFlags::CREATE | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .unwrap();
        rustix::fs::ftruncate(&fd, 4096).unwrap();
        drop(fd);

        let owner = registry.reserve("region", 256).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.size(), 256);
        drop(owner);
        assert!(shm_unlink(full_name.as_str()).is_err());
    }
}
