//! Per-request handler over the registry
//!
//! A request names a byte range of a segment. The handler checks that the
//! first word of the range holds the request's batch id and the second holds
//! [`SENTINEL`], then stamps the batch id over the sentinel. All failures are
//! returned to the caller; none of them take the worker down.

use crate::error::{Result, ShmError};
use crate::registry::Registry;
use crate::shm::{Attach, SegmentId, SysV};
use crate::view::View;
use std::sync::Arc;
use tracing::trace;

/// Marker word expected in an unclaimed slot
pub const SENTINEL: u64 = 0xDEADBEEF;

/// Where in shared memory a request's payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub shm_id: SegmentId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub batch_id: u64,
    pub sysv: Option<Locator>,
}

impl Request {
    pub fn new(batch_id: u64, locator: Locator) -> Self {
        Self {
            batch_id,
            sysv: Some(locator),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub batch_id: u64,
}

/// Identity and marker words checked at the head of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerCheck {
    pub identity: u64,
    pub expected: u64,
    pub replacement: u64,
}

impl MarkerCheck {
    /// The check a batch request performs: identity and replacement are both
    /// the batch id, the marker must be the sentinel
    pub fn for_batch(batch_id: u64) -> Self {
        Self {
            identity: batch_id,
            expected: SENTINEL,
            replacement: batch_id,
        }
    }

    /// Verify both words, then overwrite the marker
    ///
    /// Nothing is written unless both checks pass.
    pub fn apply(&self, view: &mut View) -> Result<()> {
        let identity = view.read::<u64>(0)?;
        if identity != self.identity {
            return Err(ShmError::Validation {
                field: "batch_id",
                expected: self.identity,
                got: identity,
            });
        }

        let marker = view.read::<u64>(1)?;
        if marker != self.expected {
            return Err(ShmError::Validation {
                field: "marker",
                expected: self.expected,
                got: marker,
            });
        }

        view.write::<u64>(1, self.replacement)
    }
}

/// Request handler sharing one registry across workers
pub struct Service<A: Attach = SysV> {
    registry: Arc<Registry<A>>,
}

impl<A: Attach> Clone for Service<A> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<A: Attach> Service<A> {
    pub fn new(registry: Arc<Registry<A>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry<A>> {
        &self.registry
    }

    /// Handle one request
    pub fn call(&self, request: &Request) -> Result<Response> {
        let locator = request.sysv.ok_or(ShmError::MissingLocator)?;
        trace!(
            batch_id = request.batch_id,
            shm_id = locator.shm_id,
            offset = locator.offset,
            size = locator.size,
            "handling request"
        );

        // Values past usize::MAX cannot fit any segment and fail the bounds check
        let offset = usize::try_from(locator.offset).unwrap_or(usize::MAX);
        let size = usize::try_from(locator.size).unwrap_or(usize::MAX);

        let mut view = self.registry.acquire(locator.shm_id, offset, size)?;
        MarkerCheck::for_batch(request.batch_id).apply(&mut view)?;

        Ok(Response {
            batch_id: request.batch_id,
        })
    }

    /// Management hook: drop the cached attachment for `shm_id`
    pub fn release(&self, shm_id: SegmentId) -> bool {
        self.registry.release(shm_id)
    }
}
