//! Example request server
//!
//! Plays both sides: an "allocator" creates a segment and lays out slots of
//! [batch_id, 0xDEADBEEF], then a pool of workers claims every slot through
//! the registry. The last batch is sent with the wrong id to show a
//! request-level failure.

use shmview::allocator::SysvSegment;
use shmview::{Executor, ExecutorConfig, Locator, Registry, Request, Service, SENTINEL};
use std::sync::Arc;

const SLOTS: u64 = 8;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("shmview=debug"))
        .init();

    let threads = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(2);

    let segment = match SysvSegment::create(SLOTS as usize * 16) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Server] Failed to create segment: {}", e);
            std::process::exit(1);
        }
    };
    let words: Vec<u64> = (0..SLOTS).flat_map(|i| [100 + i, SENTINEL]).collect();
    if let Err(e) = segment.write_words(0, &words) {
        eprintln!("[Server] Failed to seed segment: {}", e);
        std::process::exit(1);
    }
    println!("[Server] shm_id {} with {} slots", segment.id(), SLOTS);

    let registry = Arc::new(Registry::new());
    let config = ExecutorConfig {
        threads,
        ..Default::default()
    };
    let executor = match Executor::start(config, Service::new(registry.clone())) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("[Server] Failed to start executor: {}", e);
            std::process::exit(1);
        }
    };

    let pending: Vec<_> = (0..SLOTS)
        .filter_map(|i| {
            let batch_id = if i == SLOTS - 1 { 1 } else { 100 + i };
            let locator = Locator {
                shm_id: segment.id(),
                offset: i * 16,
                size: 16,
            };
            executor.submit(Request::new(batch_id, locator)).ok()
        })
        .collect();

    for (i, p) in pending.into_iter().enumerate() {
        match p.wait() {
            Ok(response) => println!("[Server] slot {} -> batch {}", i, response.batch_id),
            Err(e) => println!("[Server] slot {} failed: {}", i, e),
        }
    }

    registry.release(segment.id());
    println!("[Server] Done");
}
