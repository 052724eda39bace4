use super::*;
use crate::{get, lazy, suspend, FrameHandle};
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

assert_impl_all!(Task<u64>: Send);
assert_impl_all!(SharedTask<u64>: Send, Sync);
assert_impl_all!(LazyTask<u64>: Send);

type HandleSlot = Arc<parking_lot::Mutex<Option<FrameHandle>>>;

/// Task that parks at a `suspend` and completes with 0 once resumed.
fn stall(slot: HandleSlot) -> Task<u64> {
    spawn(async move {
        suspend(move |handle| *slot.lock() = Some(handle)).await;
        0
    })
}

fn inc(t: Task<u64>) -> Task<u64> {
    spawn(async move { t.await + 1 })
}

fn resume(slot: &HandleSlot) {
    slot.lock().take().expect("producer not parked").resume();
}

struct Resource(Arc<AtomicUsize>);

impl Drop for Resource {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn completes_synchronously_without_suspension() -> Result<()> {
    let t = spawn(async { 41 + 1 });
    assert!(t.is_ready());
    assert_eq!(get(t)?, 42);
    Ok(())
}

#[rstest]
#[case(1)]
#[case(64)]
#[case(4096)]
fn chained_awaits_resolve_in_order(#[case] depth: u64) -> Result<()> {
    let slot = HandleSlot::default();
    let mut t = stall(slot.clone());
    for _ in 0..depth {
        t = inc(t);
    }
    resume(&slot);
    assert_eq!(get(t)?, depth);
    Ok(())
}

/// The 65 536-deep chain: each completion resumes the next consumer
/// through the thread-local drain, so the whole cascade runs on one stack
/// frame instead of recursing.
#[test]
fn deep_chain_does_not_overflow_the_stack() -> Result<()> {
    let slot = HandleSlot::default();
    let mut t = stall(slot.clone());
    for _ in 0..65_536u64 {
        t = inc(t);
    }
    resume(&slot);
    assert_eq!(get(t)?, 65_536);
    Ok(())
}

#[test]
fn destroying_a_producer_cancels_dependants_exactly_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    let counter = drops.clone();
    // The subtask holds a resource across its await; its handle is dropped
    // immediately, leaving the parked frame as the only owner.
    drop(spawn(async move {
        let _res = Resource(counter);
        t.await;
    }));
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    slot.lock().take().unwrap().destroy();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_handle_abandons_the_result() {
    let drops = Arc::new(AtomicUsize::new(0));
    let slot = HandleSlot::default();
    let counter = drops.clone();
    let parker = slot.clone();
    let t = spawn(async move {
        let res = Resource(counter);
        suspend(move |handle| *parker.lock() = Some(handle)).await;
        res
    });
    drop(t);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // The producer still runs to completion; the result is dropped
    // unobserved when the frame finalizes as last owner.
    slot.lock().take().unwrap().resume();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn panic_is_replayed_at_the_consumer() {
    let t = spawn(async { panic!("boom") });
    let err = panic::catch_unwind(panic::AssertUnwindSafe(|| get(t))).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
}

#[test]
fn panic_crosses_intermediate_tasks() {
    let inner = spawn(async { panic!("inner") });
    let outer = spawn(async move {
        inner.await;
        1
    });
    let err = panic::catch_unwind(panic::AssertUnwindSafe(|| get(outer))).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"inner"));
}

#[test]
fn shared_task_is_observed_by_every_clone() -> Result<()> {
    let slot = HandleSlot::default();
    let shared = stall(slot.clone()).share();
    let a = shared.clone();
    let b = shared.clone();
    let ta = spawn(async move { a.await + 1 });
    let tb = spawn(async move { b.await + 2 });
    assert!(!ta.is_ready());

    resume(&slot);
    assert_eq!(get(ta)?, 1);
    assert_eq!(get(tb)?, 2);
    assert_eq!(get(shared)?, 0);
    Ok(())
}

#[test]
fn shared_task_ready_after_completion() -> Result<()> {
    let shared = spawn(async { 9u64 }).share();
    // The conversion adapter completes as soon as the source does.
    assert_eq!(get(shared.clone())?, 9);
    assert_eq!(get(shared)?, 9);
    Ok(())
}

#[test]
fn lazy_task_starts_on_first_await() -> Result<()> {
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    let lt = lazy(async move {
        counter.store(1, Ordering::SeqCst);
        5u64
    });
    assert_eq!(started.load(Ordering::SeqCst), 0);

    let t = spawn(async move { lt.await + 1 });
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(get(t)?, 6);
    Ok(())
}

#[test]
fn lazy_task_never_awaited_never_runs() {
    let started = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    let res = Resource(drops.clone());
    drop(lazy(async move {
        s.store(1, Ordering::SeqCst);
        drop(res);
    }));
    // The producer never ran, but its captures were destroyed.
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn lazy_task_blocking_get() -> Result<()> {
    assert_eq!(get(lazy(async { 3u64 }))?, 3);
    Ok(())
}

#[test]
fn resumes_from_another_thread() -> Result<()> {
    let slot = HandleSlot::default();
    let t = inc(stall(slot.clone()));
    let waker = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.lock().take().unwrap().resume();
    });
    // Blocks on the bridge until the other thread drives the chain.
    assert_eq!(get(t)?, 1);
    waker.join().unwrap();
    Ok(())
}
