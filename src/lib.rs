//! shmview - Bounded views into externally owned shared memory
//!
//! Segments are created by some other process and named by an opaque id.
//! This crate attaches to them on demand, caches the attachment, and hands
//! out cheap, independently owned views into them.
//!
//! # Architecture
//!
//! - **SegmentHandle**: one attachment; detaches when the last owner drops it
//! - **Registry**: id → shared handle cache with get-or-attach and release
//! - **View**: bounds-checked window into a handle that keeps it alive
//! - **Service / Executor**: per-request handler and the worker pool running it

pub mod error;
pub mod shm;
pub mod registry;
pub mod view;
pub mod service;
pub mod executor;

#[cfg(any(test, feature = "allocator"))]
pub mod allocator;

pub use error::{Result, ShmError};
pub use executor::{Executor, ExecutorConfig, Pending};
pub use registry::Registry;
pub use service::{Locator, MarkerCheck, Request, Response, Service, SENTINEL};
pub use shm::{Attach, Backend, Posix, SegmentHandle, SegmentId, SysV};
pub use view::{View, Word};
