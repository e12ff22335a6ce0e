//! Cache of attached segments keyed by [`SegmentId`]
//!
//! The registry owns one share of each cached [`SegmentHandle`]; every
//! [`View`] owns another. Releasing an id only drops the registry's share,
//! so in-flight views keep working and the segment is detached once the last
//! of them goes away.

use crate::error::Result;
use crate::shm::{Attach, SegmentHandle, SegmentId, SysV};
use crate::view::View;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Thread-safe map from segment id to a shared attachment
pub struct Registry<A: Attach = SysV> {
    attacher: A,
    segments: Mutex<HashMap<SegmentId, Arc<SegmentHandle>>>,
}

impl Registry<SysV> {
    /// Registry attaching System V segments
    pub fn new() -> Self {
        Self::with_attacher(SysV)
    }
}

impl Default for Registry<SysV> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Attach> Registry<A> {
    pub fn with_attacher(attacher: A) -> Self {
        Self {
            attacher,
            segments: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached handle for `id`, attaching on first use
    ///
    /// The lock is held across the attach so concurrent first calls for the
    /// same id issue a single attach and all observe the same handle.
    pub fn get_or_attach(&self, id: SegmentId) -> Result<Arc<SegmentHandle>> {
        let mut segments = self.lock();
        match segments.entry(id) {
            Entry::Occupied(cached) => Ok(cached.get().clone()),
            Entry::Vacant(vacant) => {
                debug!(shm_id = id, "attaching to segment");
                let handle = Arc::new(self.attacher.attach(id)?);
                debug!(
                    shm_id = id,
                    size = handle.size(),
                    addr = ?handle.as_ptr(),
                    "attached to segment"
                );
                Ok(vacant.insert(handle).clone())
            }
        }
    }

    /// Attach if needed and carve out a view of `len` bytes at `offset`
    pub fn acquire(&self, id: SegmentId, offset: usize, len: usize) -> Result<View> {
        View::new(self.get_or_attach(id)?, offset, len)
    }

    /// Forget the cached attachment for `id`
    ///
    /// Views created earlier keep the segment mapped until they are dropped.
    /// Releasing an unknown id is a no-op. Returns whether an entry was removed.
    pub fn release(&self, id: SegmentId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(handle) => {
                debug!(
                    shm_id = id,
                    outstanding = Arc::strong_count(&handle) - 1,
                    "released segment"
                );
                // Dropped outside the lock: this may be the last owner and detach
                drop(handle);
                true
            }
            None => {
                warn!(shm_id = id, "attempting to release an unmapped shm_id");
                false
            }
        }
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of cached attachments
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids currently cached, in ascending order
    pub fn attached_ids(&self) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn attacher(&self) -> &A {
        &self.attacher
    }

    // No code path panics while mutating the map, so a poisoned lock still
    // guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<SegmentId, Arc<SegmentHandle>>> {
        self.segments.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: Attach> fmt::Debug for Registry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("attached", &self.attached_ids())
            .finish()
    }
}
