//! Creating and removing segments on behalf of an external allocator
//!
//! The registry never allocates. This module plays the other process in
//! tests, benches, demos and the CLI `demo` command.

use crate::error::{Result, ShmError};
use crate::shm::{posix_name, Attach, SegmentHandle, SegmentId};
use rustix::fs::ftruncate;
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A private System V segment, marked for removal on drop
#[derive(Debug)]
pub struct SysvSegment {
    id: SegmentId,
    size: usize,
}

impl SysvSegment {
    pub fn create(size: usize) -> Result<Self> {
        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if shmid < 0 {
            return Err(ShmError::attach(0, io::Error::last_os_error()));
        }
        Ok(Self {
            id: shmid as SegmentId,
            size,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of live attachments, as reported by the kernel
    pub fn attach_count(&self) -> Result<usize> {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(self.id as libc::c_int, libc::IPC_STAT, &mut ds) } != 0 {
            return Err(ShmError::attach(self.id, io::Error::last_os_error()));
        }
        Ok(ds.shm_nattch as usize)
    }

    /// Write native-endian u64 words starting at word index `at`
    pub fn write_words(&self, at: usize, words: &[u64]) -> Result<()> {
        write_words(&SegmentHandle::attach(self.id)?, at, words)
    }

    pub fn read_word(&self, at: usize) -> Result<u64> {
        read_word(&SegmentHandle::attach(self.id)?, at)
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmctl(self.id as libc::c_int, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

/// A POSIX shared memory object, unlinked on drop
#[derive(Debug)]
pub struct PosixSegment {
    name: String,
    id: SegmentId,
}

impl PosixSegment {
    pub fn create(prefix: &str, id: SegmentId, size: usize) -> Result<Self> {
        let name = posix_name(prefix, id);
        let c_name = CString::new(name.clone())
            .map_err(|e| ShmError::attach(id, io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        // Leftovers from a crashed run would otherwise make EXCL fail
        let _ = shm_unlink(c_name.as_c_str());
        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| ShmError::attach(id, e))?;
        ftruncate(&fd, size as u64).map_err(|e| ShmError::attach(id, e))?;

        Ok(Self { name, id })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }
}

impl Drop for PosixSegment {
    fn drop(&mut self) {
        if let Ok(c_name) = CString::new(self.name.clone()) {
            let _ = shm_unlink(c_name.as_c_str());
        }
    }
}

/// Counts physical attaches made through the wrapped backend
#[derive(Debug, Clone)]
pub struct CountingAttacher<A> {
    inner: A,
    attaches: Arc<AtomicUsize>,
    delay: Duration,
}

impl<A: Attach> CountingAttacher<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            attaches: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    /// Sleep inside every attach, widening any race around it
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Shared counter, still readable after the attacher moved into a registry
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.attaches.clone()
    }
}

impl<A: Attach> Attach for CountingAttacher<A> {
    fn attach(&self, id: SegmentId) -> Result<SegmentHandle> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.attach(id)
    }
}

pub fn write_words(handle: &SegmentHandle, at: usize, words: &[u64]) -> Result<()> {
    check_words(handle, at, words.len())?;
    let base = handle.as_ptr().cast::<u64>();
    for (i, word) in words.iter().enumerate() {
        unsafe { base.add(at + i).write_unaligned(*word) };
    }
    Ok(())
}

pub fn read_word(handle: &SegmentHandle, at: usize) -> Result<u64> {
    check_words(handle, at, 1)?;
    Ok(unsafe { handle.as_ptr().cast::<u64>().add(at).read_unaligned() })
}

fn check_words(handle: &SegmentHandle, at: usize, count: usize) -> Result<()> {
    let word = std::mem::size_of::<u64>();
    let fits = at
        .checked_add(count)
        .and_then(|end| end.checked_mul(word))
        .is_some_and(|end| end <= handle.size());
    if fits {
        Ok(())
    } else {
        Err(ShmError::Range {
            offset: at.saturating_mul(word),
            len: count.saturating_mul(word),
            bound: handle.size(),
        })
    }
}

/// Run `work(task, iteration)` on `tasks` threads, `iterations` times each
///
/// Panics with the task and iteration of the first failure seen.
pub fn execute_concurrent<F>(tasks: usize, iterations: usize, work: F)
where
    F: Fn(usize, usize) -> Result<()> + Clone + Send + Sync + 'static,
{
    let workers: Vec<_> = (0..tasks)
        .map(|task| {
            let work = work.clone();
            std::thread::spawn(move || {
                (0..iterations).try_for_each(|iteration| {
                    work(task, iteration).map_err(|e| (iteration, e))
                })
            })
        })
        .collect();

    for (task, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err((iteration, e))) => panic!("task {task} failed at iteration {iteration}: {e}"),
            Err(_) => panic!("task {task} panicked"),
        }
    }
}
