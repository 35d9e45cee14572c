//! Linux-specific shared memory operations
//!
//! Segments are regular files on a tmpfs (normally `/dev/shm`) mapped
//! `MAP_SHARED`, so any process that can open the path sees the same pages.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::sys::mman;
use nix::unistd::getpid;
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

/// Linux-specific memory mapping configuration
#[derive(Debug, Clone, Copy)]
pub struct LinuxMemoryConfig {
    /// Prefault pages at map time (MAP_POPULATE)
    pub populate: bool,
    /// Lock pages in RAM after mapping
    pub locked: bool,
}

impl Default for LinuxMemoryConfig {
    fn default() -> Self {
        Self {
            populate: true,
            locked: false,
        }
    }
}

/// Create a new segment file of `size` bytes and map it.
///
/// Fails with `AlreadyExists` if the path is taken, so two servers can never
/// silently share a segment.
pub fn create_segment_mmap(
    path: &Path,
    size: usize,
    config: &LinuxMemoryConfig,
) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ShmError::AlreadyExists {
                name: path.display().to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    file.set_len(size as u64)?;

    let mut options = MmapOptions::new();
    options.len(size);
    if config.populate {
        options.populate();
    }

    let mmap = unsafe { options.map_mut(&file)? };

    if config.locked {
        if let Err(e) = lock_memory(mmap.as_ptr(), mmap.len()) {
            tracing::warn!(path = %path.display(), "cannot lock segment pages: {e}");
        }
    }

    Ok(mmap)
}

/// Map an existing segment file in its entirety.
pub fn attach_segment_mmap(path: &Path) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShmError::NotFound {
                name: path.display().to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Change the length of an existing segment file and map it again.
///
/// The caller must have dropped every previous mapping of this file that
/// could observe the truncated tail.
pub fn resize_segment_mmap(path: &Path, size: usize) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShmError::NotFound {
                name: path.display().to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    file.set_len(size as u64)?;
    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok(mmap)
}

/// Remove a segment file. Missing files are not an error.
pub fn destroy_segment(path: &Path) -> ShmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ShmError::Io { source: e }),
    }
}

/// Pin `len` bytes starting at `addr` in physical memory.
pub fn lock_memory(addr: *const u8, len: usize) -> std::io::Result<()> {
    let addr = NonNull::new(addr.cast_mut().cast::<c_void>())
        .ok_or_else(|| std::io::Error::from(Errno::EINVAL))?;
    // SAFETY: callers pass a live mapping; mlock only pins its pages.
    unsafe { mman::mlock(addr, len) }.map_err(std::io::Error::from)
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => true,
            Err(nix::Error::ESRCH) => false,
            Err(nix::Error::EPERM) => true, // exists, owned by someone else
            Err(_) => false,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        false
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
    }

    #[test]
    fn test_lock_memory_pins_mapping_or_hits_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mmap = create_segment_mmap(&dir.path().join("locked"), 4096, &LinuxMemoryConfig::default())
            .unwrap();
        if let Err(e) = lock_memory(mmap.as_ptr(), mmap.len()) {
            let errno = e.raw_os_error().map(Errno::from_raw);
            assert!(
                matches!(errno, Some(Errno::EPERM | Errno::ENOMEM | Errno::EAGAIN)),
                "{e}"
            );
        }

        let null = lock_memory(std::ptr::null(), 4096).unwrap_err();
        assert_eq!(null.raw_os_error(), Some(Errno::EINVAL as i32));
    }

    #[test]
    fn test_create_attach_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut created = create_segment_mmap(&path, 8192, &LinuxMemoryConfig::default()).unwrap();
        created[100] = 0x5A;

        let attached = attach_segment_mmap(&path).unwrap();
        assert_eq!(attached.len(), 8192);
        assert_eq!(attached[100], 0x5A);

        assert!(matches!(
            create_segment_mmap(&path, 8192, &LinuxMemoryConfig::default()),
            Err(ShmError::AlreadyExists { .. })
        ));

        destroy_segment(&path).unwrap();
        destroy_segment(&path).unwrap();
        assert!(matches!(
            attach_segment_mmap(&path),
            Err(ShmError::NotFound { .. })
        ));
    }
}
