/// Tests for the filesystem-mutex slot pool under contention
use serial_test::serial;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use jailbox::{
    lock_manager::{held_slots, DirLockBackend, LockBackend, SlotLock, LOCK_DIR_NAME, LOCK_PID_FILE},
    types::SandboxError,
};

use crate::create_test_pool;

fn pool_backend(slots: u32) -> (crate::TestPool, Arc<DirLockBackend>) {
    let pool = create_test_pool(slots, 0);
    let backend = Arc::new(DirLockBackend::new(pool.base_dir(), "jailuser"));
    (pool, backend)
}

#[test]
#[serial]
fn test_concurrent_acquire_single_slot() {
    let (_pool, backend) = pool_backend(1);
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let barrier = barrier.clone();
            let backend: Arc<dyn LockBackend> = backend.clone();
            thread::spawn(move || {
                barrier.wait();
                SlotLock::acquire_as(backend, 1000 + i as u32)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(SandboxError::NoAvailableSlot { .. })))
        .count();

    // One holder at a time, everyone else is told the pool is full
    assert_eq!(winners, 1);
    assert_eq!(busy, threads - 1);

    for result in results {
        if let Ok(mut lock) = result {
            lock.release().unwrap();
        }
    }
    assert!(held_slots(backend.as_ref()).unwrap().is_empty());
}

#[test]
#[serial]
fn test_concurrent_acquire_fills_pool_without_sharing() {
    let (_pool, backend) = pool_backend(3);
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..3u32)
        .map(|i| {
            let barrier = barrier.clone();
            let backend: Arc<dyn LockBackend> = backend.clone();
            thread::spawn(move || {
                barrier.wait();
                SlotLock::acquire_as(backend, 2000 + i)
            })
        })
        .collect();

    let mut locks: Vec<SlotLock> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
    let mut ids: Vec<u32> = locks.iter().map(SlotLock::id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);

    let held = held_slots(backend.as_ref()).unwrap();
    assert_eq!(held.len(), 3);
    for lock in &locks {
        assert!(held.contains(&(lock.slot().clone(), lock.owner())));
    }

    for lock in locks.iter_mut() {
        lock.release().unwrap();
    }
}

#[test]
#[serial]
fn test_foreign_release_is_rejected() {
    let (pool, backend) = pool_backend(1);
    let mut lock = SlotLock::acquire_as(backend.clone(), 4242).unwrap();

    let marker = pool.base_dir().join("jailuser0").join(LOCK_DIR_NAME);
    assert_eq!(
        fs::read_to_string(marker.join(LOCK_PID_FILE)).unwrap().trim(),
        "4242"
    );

    let result = backend.release(lock.slot(), 7);
    match result {
        Err(SandboxError::LockOwnershipViolation {
            slot,
            lock_pid,
            release_pid,
        }) => {
            assert_eq!(slot, "jailuser0");
            assert_eq!(lock_pid, 4242);
            assert_eq!(release_pid, 7);
        }
        other => panic!("expected ownership violation, got {:?}", other.err()),
    }
    assert!(marker.exists());

    lock.release().unwrap();
    assert!(!marker.exists());
}
