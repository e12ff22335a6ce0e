//! Releasing a segment while a view into it is still in use
//!
//! The view keeps working after release; the next acquire attaches again and
//! sees the same bytes.

use shmview::allocator::SysvSegment;
use shmview::{Registry, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("shmview=debug"))
        .init();

    let segment = SysvSegment::create(4096)?;
    let registry = Registry::new();

    let mut before = registry.acquire(segment.id(), 0, 64)?;
    println!("attachments: {}", segment.attach_count()?);

    registry.release(segment.id());
    registry.release(segment.id());
    before.write::<u64>(0, 0xC0FFEE)?;

    let after = registry.acquire(segment.id(), 0, 64)?;
    println!("attachments: {}", segment.attach_count()?);
    println!("word 0 via fresh attach: {:#x}", after.read::<u64>(0)?);

    drop(before);
    println!("attachments after old view dropped: {}", segment.attach_count()?);
    Ok(())
}
