//! Property tests for the bounded buffer pool
//!
//! Random request/return sequences must never let the pool grow past its
//! bound, lose a buffer or keep more idle buffers than `auto_free` allows.

mod common;

use feature_pipe::buffer::{BufferPool, ImageAllocator, ImageFormat, ImageHandle, ImageSize, ImageSpec};
use proptest::prelude::*;
use std::thread;
use std::time::Duration;

fn pool(bound: usize, auto_free: Option<usize>) -> BufferPool<ImageAllocator> {
    let pool = BufferPool::new(
        "prop",
        ImageAllocator::new(ImageSpec::new(ImageSize::new(8, 8), ImageFormat::Yuy2)),
    );
    pool.set_auto_allocate(bound);
    pool.set_auto_free(auto_free);
    pool
}

proptest! {
    #[test]
    fn test_pool_never_exceeds_bound(
        bound in 1usize..6,
        ops in prop::collection::vec(any::<bool>(), 1..60)
    ) {
        let pool = pool(bound, None);
        let mut held: Vec<ImageHandle> = Vec::new();

        for take in ops {
            if take {
                match pool.try_request().unwrap() {
                    Some(buffer) => held.push(buffer),
                    None => prop_assert_eq!(held.len(), bound),
                }
            } else {
                held.pop();
            }
            prop_assert!(pool.pool_size() <= bound);
            prop_assert_eq!(pool.available_size() + held.len(), pool.pool_size());
        }
    }

    #[test]
    fn test_auto_free_caps_idle_buffers(
        bound in 2usize..8,
        keep in 0usize..3,
        taken in 1usize..8
    ) {
        let pool = pool(bound, Some(keep));
        let held: Vec<ImageHandle> = (0..taken.min(bound))
            .map(|_| pool.try_request().unwrap().unwrap())
            .collect();
        let outstanding = held.len();
        drop(held);

        prop_assert_eq!(pool.available_size(), keep.min(outstanding));
        prop_assert_eq!(pool.pool_size(), pool.available_size());
    }
}

#[test]
fn test_blocked_request_wakes_on_return() {
    common::init_tracing();
    let pool = pool(1, None);
    let first = pool.request().unwrap();
    let serial = first.serial();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.request().map(|buffer| buffer.serial()))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    drop(first);
    assert_eq!(waiter.join().unwrap().unwrap(), serial);
    assert_eq!(pool.pool_size(), 1);
}
