use shmview::allocator::{execute_concurrent, CountingAttacher, PosixSegment, SysvSegment};
use shmview::{
    Executor, ExecutorConfig, Locator, Posix, Registry, Request, Service, ShmError, SysV,
    SENTINEL,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn single_attach_under_contention() {
    let segment = SysvSegment::create(4096).unwrap();
    let attacher = CountingAttacher::new(SysV).with_delay(Duration::from_millis(20));
    let attaches = attacher.counter();
    let registry = Arc::new(Registry::with_attacher(attacher));

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let seen = seen.clone();
            let id = segment.id();
            thread::spawn(move || {
                barrier.wait();
                let handle = registry.get_or_attach(id).unwrap();
                seen.lock()
                    .unwrap()
                    .push((handle.as_ptr() as usize, handle.size()));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(attaches.load(Ordering::SeqCst), 1);
    assert_eq!(segment.attach_count().unwrap(), 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), threads);
    assert!(seen.iter().all(|entry| *entry == seen[0]));
    assert_eq!(seen[0].1, 4096);
}

#[test]
fn end_to_end_marker_exchange() {
    let prefix = "shmview_it_e2e";
    let _segment = PosixSegment::create(prefix, 7, 64).unwrap();
    let registry = Arc::new(Registry::with_attacher(Posix::new(prefix)));
    let service = Service::new(registry.clone());

    let mut seed = registry.acquire(7, 0, 64).unwrap();
    seed.write::<u64>(0, 42).unwrap();
    seed.write::<u64>(1, SENTINEL).unwrap();
    seed.write::<u64>(2, 99).unwrap();
    seed.write::<u64>(3, SENTINEL).unwrap();

    let locator = Locator {
        shm_id: 7,
        offset: 0,
        size: 16,
    };
    let response = service.call(&Request::new(42, locator)).unwrap();
    assert_eq!(response.batch_id, 42);
    assert_eq!(seed.read::<u64>(1).unwrap(), 42);

    // Slot at offset 16 belongs to batch 99
    let locator = Locator {
        shm_id: 7,
        offset: 16,
        size: 16,
    };
    let err = service.call(&Request::new(42, locator)).unwrap_err();
    assert!(matches!(err, ShmError::Validation { field: "batch_id", .. }));
    assert_eq!(seed.read::<u64>(3).unwrap(), SENTINEL);
}

#[test]
fn concurrent_disjoint_slots() {
    let slots = 64usize;
    let segment = SysvSegment::create(slots * 16).unwrap();
    for slot in 0..slots {
        segment
            .write_words(slot * 2, &[slot as u64 + 1000, SENTINEL])
            .unwrap();
    }

    let registry = Arc::new(Registry::new());
    let config = ExecutorConfig {
        threads: 8,
        queue_depth: 16,
    };
    let executor = Executor::start(config, Service::new(registry.clone())).unwrap();

    let pending: Vec<_> = (0..slots)
        .map(|slot| {
            let locator = Locator {
                shm_id: segment.id(),
                offset: (slot * 16) as u64,
                size: 16,
            };
            executor
                .submit(Request::new(slot as u64 + 1000, locator))
                .unwrap()
        })
        .collect();

    for (slot, pending) in pending.into_iter().enumerate() {
        assert_eq!(pending.wait().unwrap().batch_id, slot as u64 + 1000);
    }
    for slot in 0..slots {
        assert_eq!(segment.read_word(slot * 2).unwrap(), slot as u64 + 1000);
        assert_eq!(segment.read_word(slot * 2 + 1).unwrap(), slot as u64 + 1000);
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn views_survive_concurrent_release() {
    let segment = SysvSegment::create(8 * 128).unwrap();
    let id = segment.id();
    let registry = Arc::new(Registry::new());

    execute_concurrent(8, 200, {
        let registry = registry.clone();
        move |task, iteration| {
            if iteration % 7 == 0 {
                registry.release(id);
            }
            let mut view = registry.acquire(id, task * 128, 128)?;
            let word = iteration % 16;
            view.write::<u64>(word, (task * 1000 + iteration) as u64)?;
            if view.read::<u64>(word)? != (task * 1000 + iteration) as u64 {
                return Err(ShmError::Validation {
                    field: "word",
                    expected: (task * 1000 + iteration) as u64,
                    got: view.read::<u64>(word)?,
                });
            }
            Ok(())
        }
    });

    registry.release(id);
    assert!(registry.is_empty());
    assert_eq!(segment.attach_count().unwrap(), 0);
}
