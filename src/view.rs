//! Bounded windows into an attached segment
//!
//! A [`View`] covers `[offset, offset + len)` of one segment and keeps the
//! segment mapped for as long as it lives, even if the registry has since
//! released it. Every access is checked against the view's length.

use crate::error::{Result, ShmError};
use crate::shm::SegmentHandle;
use std::fmt;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width integers that can be read from and written to a view
pub trait Word: sealed::Sealed + Copy {
    const SIZE: usize = std::mem::size_of::<Self>();
}

macro_rules! impl_word {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Word for $t {}
        )*
    };
}

impl_word!(u8, u16, u32, u64, i8, i16, i32, i64, usize);

/// A read/write window into a shared memory segment
pub struct View {
    segment: Arc<SegmentHandle>,
    offset: usize,
    len: usize,
}

impl View {
    /// Create a view of `len` bytes starting `offset` bytes into `segment`
    ///
    /// Fails with [`ShmError::Range`] unless `offset + len <= segment.size()`.
    pub fn new(segment: Arc<SegmentHandle>, offset: usize, len: usize) -> Result<Self> {
        match offset.checked_add(len) {
            Some(end) if end <= segment.size() => Ok(Self {
                segment,
                offset,
                len,
            }),
            _ => Err(ShmError::Range {
                offset,
                len,
                bound: segment.size(),
            }),
        }
    }

    /// Byte offset of this view inside its segment
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The segment this view keeps alive
    pub fn segment(&self) -> &Arc<SegmentHandle> {
        &self.segment
    }

    /// Number of whole `W` words in the view
    pub fn words<W: Word>(&self) -> usize {
        self.len / W::SIZE
    }

    /// Read the `index`-th `W` word, treating the view as `[W]`
    pub fn read<W: Word>(&self, index: usize) -> Result<W> {
        let ptr = self.word_ptr::<W>(index)?;
        Ok(unsafe { ptr.cast::<W>().read_unaligned() })
    }

    /// Overwrite the `index`-th `W` word
    pub fn write<W: Word>(&mut self, index: usize, value: W) -> Result<()> {
        let ptr = self.word_ptr::<W>(index)?;
        unsafe { ptr.cast::<W>().write_unaligned(value) };
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at byte `at` into `buf`
    pub fn read_bytes(&self, at: usize, buf: &mut [u8]) -> Result<()> {
        let src = self.ptr_at(at, buf.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `data` into the view starting at byte `at`
    pub fn write_bytes(&mut self, at: usize, data: &[u8]) -> Result<()> {
        let dst = self.ptr_at(at, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Raw pointer to the first byte of the view
    pub fn as_ptr(&self) -> *mut u8 {
        // offset <= segment size was checked at construction
        unsafe { self.segment.as_ptr().add(self.offset) }
    }

    fn word_ptr<W: Word>(&self, index: usize) -> Result<*mut u8> {
        let at = index.checked_mul(W::SIZE).ok_or(ShmError::Range {
            offset: usize::MAX,
            len: W::SIZE,
            bound: self.len,
        })?;
        self.ptr_at(at, W::SIZE)
    }

    fn ptr_at(&self, at: usize, len: usize) -> Result<*mut u8> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(unsafe { self.as_ptr().add(at) }),
            _ => Err(ShmError::Range {
                offset: at,
                len,
                bound: self.len,
            }),
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("shm_id", &self.segment.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SysvSegment;

    fn handle(size: usize) -> (SysvSegment, Arc<SegmentHandle>) {
        let segment = SysvSegment::create(size).unwrap();
        let handle = Arc::new(SegmentHandle::attach(segment.id()).unwrap());
        (segment, handle)
    }

    #[test]
    fn test_bounds_at_construction() {
        let (_segment, handle) = handle(64);

        for offset in 0..=70 {
            for len in 0..=70 {
                let view = View::new(handle.clone(), offset, len);
                if offset + len <= 64 {
                    assert!(view.is_ok(), "offset {offset} len {len}");
                } else {
                    assert!(
                        matches!(view, Err(ShmError::Range { bound: 64, .. })),
                        "offset {offset} len {len}"
                    );
                }
            }
        }

        assert!(View::new(handle.clone(), usize::MAX, 2).is_err());
        assert!(View::new(handle, 1, usize::MAX).is_err());
    }

    #[test]
    fn test_word_access() {
        let (_segment, handle) = handle(64);
        let mut view = View::new(handle, 16, 16).unwrap();
        assert_eq!(view.words::<u64>(), 2);
        assert_eq!(view.words::<u32>(), 4);

        view.write::<u64>(0, 42).unwrap();
        view.write::<u64>(1, 0xDEADBEEF).unwrap();
        assert_eq!(view.read::<u64>(0).unwrap(), 42);
        assert_eq!(view.read::<u64>(1).unwrap(), 0xDEADBEEF);

        assert!(matches!(
            view.read::<u64>(2),
            Err(ShmError::Range { offset: 16, len: 8, bound: 16 })
        ));
        assert!(view.write::<u32>(4, 1).is_err());
        assert!(view.read::<u64>(usize::MAX).is_err());
    }

    #[test]
    fn test_view_is_relative_to_offset() {
        let (_segment, handle) = handle(32);
        let mut whole = View::new(handle.clone(), 0, 32).unwrap();
        let mut tail = View::new(handle, 8, 8).unwrap();

        tail.write::<u64>(0, 7).unwrap();
        assert_eq!(whole.read::<u64>(1).unwrap(), 7);

        whole.write_bytes(8, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        tail.read_bytes(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        assert!(tail.write_bytes(6, &[0; 3]).is_err());
        assert!(tail.read_bytes(8, &mut []).is_ok());
    }

    #[test]
    fn test_empty_view() {
        let (_segment, handle) = handle(16);
        let view = View::new(handle, 16, 0).unwrap();
        assert!(view.is_empty());
        assert_eq!(view.words::<u8>(), 0);
        assert!(view.read::<u8>(0).is_err());
    }

    #[test]
    fn test_view_keeps_segment_mapped() {
        let (segment, handle) = handle(64);
        let mut view = View::new(handle.clone(), 0, 64).unwrap();
        drop(handle);

        assert_eq!(segment.attach_count().unwrap(), 1);
        view.write::<u64>(3, 99).unwrap();
        assert_eq!(segment.read_word(3).unwrap(), 99);

        drop(view);
        assert_eq!(segment.attach_count().unwrap(), 0);
    }
}
