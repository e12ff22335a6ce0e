//! Attaching to shared memory segments owned by another process
//!
//! Nothing here creates or sizes a segment. A [`SegmentHandle`] maps an
//! existing segment, named by an opaque [`SegmentId`], into this process and
//! unmaps it exactly once when dropped.

use crate::error::{Result, ShmError};
use rustix::fs::fstat;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, Mode, ShmOFlags};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::ptr::NonNull;

/// Opaque id handed out by whoever allocated the segment
pub type SegmentId = u64;

/// Which OS facility a handle was attached through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// System V shared memory (`shmat`/`shmdt`)
    SysV,
    /// POSIX shared memory object (`shm_open` + `mmap`)
    Posix,
}

/// One attachment of a shared memory segment into this address space
pub struct SegmentHandle {
    id: SegmentId,
    addr: NonNull<u8>,
    size: usize,
    backend: Backend,
}

// SAFETY: the mapping stays valid for the lifetime of the handle and its
// address and size never change. Synchronising access to the bytes is up to
// the views that write through it.
unsafe impl Send for SegmentHandle {}
unsafe impl Sync for SegmentHandle {}

impl SegmentHandle {
    /// Attach to the System V segment `id`
    pub fn attach(id: SegmentId) -> Result<Self> {
        let shmid = libc::c_int::try_from(id).map_err(|_| {
            ShmError::attach(
                id,
                io::Error::new(io::ErrorKind::InvalidInput, "shm_id out of range"),
            )
        })?;

        // SAFETY: shmid_ds is plain old data, IPC_STAT fills it in
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) } != 0 {
            return Err(ShmError::attach(id, io::Error::last_os_error()));
        }
        let size = ds.shm_segsz as usize;
        if size == 0 {
            return Err(ShmError::attach(id, empty_segment()));
        }

        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(ShmError::attach(id, io::Error::last_os_error()));
        }
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| ShmError::attach(id, io::ErrorKind::AddrNotAvailable))?;

        Ok(Self {
            id,
            addr,
            size,
            backend: Backend::SysV,
        })
    }

    /// Open the POSIX shared memory object `/{prefix}_{id}` and map all of it
    pub fn open_posix(prefix: &str, id: SegmentId) -> Result<Self> {
        let c_name = CString::new(posix_name(prefix, id))
            .map_err(|e| ShmError::attach(id, io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| ShmError::attach(id, e))?;

        let stat = fstat(&fd).map_err(|e| ShmError::attach(id, e))?;
        let size = usize::try_from(stat.st_size).unwrap_or(0);
        if size == 0 {
            return Err(ShmError::attach(id, empty_segment()));
        }

        // The mapping outlives the descriptor, so `fd` is closed on return
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| ShmError::attach(id, e))?
        };
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| ShmError::attach(id, io::ErrorKind::AddrNotAvailable))?;

        Ok(Self {
            id,
            addr,
            size,
            backend: Backend::Posix,
        })
    }

    /// Base address of the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Total size of the segment in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[inline(always)]
    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("backend", &self.backend)
            .finish()
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        tracing::debug!(shm_id = self.id, size = self.size, "detaching segment");
        match self.backend {
            Backend::SysV => unsafe {
                libc::shmdt(self.addr.as_ptr().cast());
            },
            Backend::Posix => unsafe {
                let _ = munmap(self.addr.as_ptr().cast(), self.size);
            },
        }
    }
}

pub(crate) fn posix_name(prefix: &str, id: SegmentId) -> String {
    format!("/{}_{}", prefix, id)
}

fn empty_segment() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "segment has zero size")
}

/// Maps a [`SegmentId`] to a fresh attachment
///
/// The registry calls this at most once per id while the id is cached.
pub trait Attach: Send + Sync {
    fn attach(&self, id: SegmentId) -> Result<SegmentHandle>;
}

/// System V backend, the default
#[derive(Debug, Default, Clone, Copy)]
pub struct SysV;

impl Attach for SysV {
    fn attach(&self, id: SegmentId) -> Result<SegmentHandle> {
        SegmentHandle::attach(id)
    }
}

/// POSIX backend resolving ids to `/{prefix}_{id}`
#[derive(Debug, Clone)]
pub struct Posix {
    prefix: String,
}

impl Posix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Attach for Posix {
    fn attach(&self, id: SegmentId) -> Result<SegmentHandle> {
        SegmentHandle::open_posix(&self.prefix, id)
    }
}
