//! Low-level POSIX shared memory operations

use crate::error::{BenchError, Result};
use crate::lifecycle::{c_name, log_release, remove_stale, Owner};
use log::debug;
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Mapping of a named shared memory segment
pub struct SharedRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    c_name: CString,
    owner: Option<Owner>,
}

// SAFETY: the region is plain memory; access to its contents is gated by
// the semaphores stored inside it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a fresh, zeroed region of `size` bytes under `name`.
    ///
    /// Any segment left under the same name is unlinked first, then the new
    /// one is created exclusively.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = c_name(name)?;
        remove_stale("shared memory", name, || {
            shm_unlink(c_name.as_c_str()).map_err(Into::into)
        })?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| create_error(name, "shm_open", e.into()))?;

        // From here on the segment exists; unlink it again if setup fails.
        let unlink_on_err = |err: BenchError| {
            let _ = shm_unlink(c_name.as_c_str());
            err
        };

        ftruncate(&fd, size as u64)
            .map_err(|e| unlink_on_err(create_error(name, "ftruncate", e.into())))?;

        let actual = fstat(&fd)
            .map_err(|e| unlink_on_err(create_error(name, "fstat", e.into())))?
            .st_size as usize;
        if actual < size {
            return Err(unlink_on_err(BenchError::Undersized {
                resource: "shared memory",
                name: name.to_string(),
                required: size,
                actual,
            }));
        }

        let addr = map(&fd, size).map_err(|e| unlink_on_err(create_error(name, "mmap", e)))?;

        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        debug!("created shared memory '{}' ({} bytes)", name, size);

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            c_name,
            owner: Some(Owner::current()),
        })
    }

    /// Attach to an existing region without taking ownership
    pub fn open(name: &str) -> Result<Self> {
        let c_name = c_name(name)?;
        let open_error = |op, source| BenchError::ResourceCreate {
            resource: "shared memory",
            name: name.to_string(),
            op,
            source,
        };

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| open_error("shm_open", e.into()))?;
        let size = fstat(&fd)
            .map_err(|e| open_error("fstat", e.into()))?
            .st_size as usize;
        let addr = map(&fd, size).map_err(|e| open_error("mmap", e))?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            c_name,
            owner: None,
        })
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle will unlink the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.owner.is_some_and(|o| o.is_current())
    }

    /// Unlink the segment name now; the mapping stays valid until drop
    pub fn remove(&mut self) -> Result<()> {
        if !self.is_owner() {
            return Ok(());
        }
        self.owner = None;
        match shm_unlink(self.c_name.as_c_str()) {
            Ok(()) => {
                debug!("removed shared memory '{}'", self.name);
                Ok(())
            }
            Err(e) => Err(BenchError::ResourceRemove {
                resource: "shared memory",
                name: self.name.clone(),
                op: "shm_unlink",
                source: e.into(),
            }),
        }
    }
}

fn map(fd: &OwnedFd, size: usize) -> std::io::Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "mmap returned null"))
}

fn create_error(name: &str, op: &'static str, source: std::io::Error) -> BenchError {
    BenchError::ResourceCreate {
        resource: "shared memory",
        name: name.to_string(),
        op,
        source,
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner() {
            log_release(
                "shared memory",
                &self.name,
                shm_unlink(self.c_name.as_c_str()).map_err(Into::into),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = "/ipc_latency_test_shm_open";
        let size = 4096;

        let shm1 = SharedRegion::create(name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        let shm2 = SharedRegion::open(name).unwrap();
        assert!(!shm2.is_owner());
        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(shm2);
        drop(shm1);
        assert!(SharedRegion::open(name).is_err());
    }

    #[test]
    fn test_create_replaces_stale_segment() {
        let name = "/ipc_latency_test_shm_stale";
        let first = SharedRegion::create(name, 128).unwrap();
        unsafe {
            std::ptr::write(first.as_ptr(), 7u8);
        }
        // Simulate a crashed run: the segment is never unlinked.
        std::mem::forget(first);

        let second = SharedRegion::create(name, 256).unwrap();
        assert_eq!(second.size(), 256);
        let val = unsafe { std::ptr::read(second.as_ptr()) };
        assert_eq!(val, 0);
    }

    #[test]
    fn test_remove_then_recreate() {
        let name = "/ipc_latency_test_shm_remove";
        let mut region = SharedRegion::create(name, 64).unwrap();
        region.remove().unwrap();
        assert!(!region.is_owner());
        assert!(SharedRegion::open(name).is_err());

        let again = SharedRegion::create(name, 64).unwrap();
        assert!(again.is_owner());
    }
}
