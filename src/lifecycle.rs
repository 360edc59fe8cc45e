//! Naming and ownership of kernel resources
//!
//! Every named object a run uses (shared memory segment, POSIX queues,
//! System V queues and semaphore sets) is derived from the configured
//! namespace, so a second run finds and removes the first run's residue
//! before creating its own. Only the process that created an object removes
//! it; forked workers inherit handles but never unlink.

use crate::error::{BenchError, Result};
use log::{debug, warn};
use nix::unistd::getpid;
use std::ffi::CString;
use std::io;

/// Direction of a queue relative to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Coordinator to worker
    Down,
    /// Worker to coordinator
    Up,
}

impl QueueRole {
    fn as_str(self) -> &'static str {
        match self {
            QueueRole::Down => "down",
            QueueRole::Up => "up",
        }
    }
}

/// Derives resource names and keys from a namespace
#[derive(Debug, Clone)]
pub struct ResourceNames {
    namespace: String,
}

impl ResourceNames {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// POSIX shared memory name
    pub fn shm(&self) -> String {
        format!("/{}_shm", self.namespace)
    }

    /// POSIX message queue name for one worker slot
    pub fn posix_queue(&self, role: QueueRole, slot: usize) -> String {
        format!("/{}_{}_{}", self.namespace, role.as_str(), slot)
    }

    /// Human-readable label for a System V object
    pub fn sysv_label(&self, role: &str) -> String {
        format!("{}_{}", self.namespace, role)
    }

    /// System V IPC key for `role`, stable across runs of the same namespace
    pub fn sysv_key(&self, role: &str) -> libc::key_t {
        sysv_key_for(&self.sysv_label(role))
    }
}

/// FNV-1a over the label, folded into a positive non-zero key.
///
/// Zero is `IPC_PRIVATE` and must never come out of here.
pub fn sysv_key_for(label: &str) -> libc::key_t {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = label
        .bytes()
        .fold(OFFSET, |h, b| (h ^ b as u32).wrapping_mul(PRIME));
    let key = (hash & 0x7fff_ffff) as libc::key_t;
    if key == 0 {
        1
    } else {
        key
    }
}

/// Process that created a resource; the only one allowed to remove it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pid: i32,
}

impl Owner {
    pub fn current() -> Self {
        Self {
            pid: getpid().as_raw(),
        }
    }

    /// False inside a forked worker, which shares the parent's memory image
    #[inline]
    pub fn is_current(&self) -> bool {
        getpid().as_raw() == self.pid
    }
}

pub(crate) fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BenchError::config(format!("resource name '{}' contains NUL", name)))
}

/// Remove leftovers from an earlier run; absence counts as success.
pub(crate) fn remove_stale(
    resource: &'static str,
    name: &str,
    remove: impl FnOnce() -> io::Result<()>,
) -> Result<()> {
    match remove() {
        Ok(()) => {
            debug!("removed stale {} '{}'", resource, name);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BenchError::ResourceRemove {
            resource,
            name: name.to_string(),
            op: "remove stale",
            source: e,
        }),
    }
}

/// Log the outcome of a removal that happens from `Drop`, where errors
/// cannot propagate.
pub(crate) fn log_release(resource: &'static str, name: &str, result: io::Result<()>) {
    match result {
        Ok(()) => debug!("removed {} '{}'", resource, name),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {} '{}': {}", resource, name, e),
    }
}

/// Convert a libc return code into an `io::Result`
#[inline]
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_namespaced() {
        let names = ResourceNames::new("bench");
        assert_eq!(names.shm(), "/bench_shm");
        assert_eq!(names.posix_queue(QueueRole::Down, 0), "/bench_down_0");
        assert_eq!(names.posix_queue(QueueRole::Up, 3), "/bench_up_3");
    }

    #[test]
    fn test_sysv_keys_stable_and_distinct() {
        let names = ResourceNames::new("bench");
        assert_eq!(names.sysv_key("sem"), names.sysv_key("sem"));
        assert_ne!(names.sysv_key("down"), names.sysv_key("up"));
        assert_ne!(
            names.sysv_key("sem"),
            ResourceNames::new("other").sysv_key("sem")
        );
        assert!(names.sysv_key("sem") > 0);
    }

    #[test]
    fn test_owner_is_current_process() {
        assert!(Owner::current().is_current());
    }

    #[test]
    fn test_remove_stale_tolerates_missing() {
        let ok = remove_stale("queue", "/nope", || Err(io::Error::from(io::ErrorKind::NotFound)));
        assert!(ok.is_ok());
        let err = remove_stale("queue", "/nope", || {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .unwrap_err();
        assert!(matches!(err, BenchError::ResourceRemove { .. }));
        assert!(err.to_string().contains("/nope"));
    }
}
