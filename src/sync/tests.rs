use super::*;
use crate::join::Join;
use crate::{get, spawn, suspend, when_ready, FrameHandle, Task};
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

assert_impl_all!(Event: Send, Sync);
assert_impl_all!(Mutex: Send, Sync);
assert_impl_all!(Channel<u64>: Send, Sync);
assert_impl_all!(WorkGroup: Send, Sync);

type HandleSlot = Arc<parking_lot::Mutex<Option<FrameHandle>>>;

fn stall(slot: HandleSlot, value: u64) -> Task<u64> {
    spawn(async move {
        suspend(move |handle| *slot.lock() = Some(handle)).await;
        value
    })
}

struct Resource(Arc<AtomicUsize>);

impl Drop for Resource {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ===== event =====

#[test]
fn event_already_set_completes_immediately() -> Result<()> {
    let ev = Arc::new(Event::new());
    ev.set();
    let waiter = ev.clone();
    let t = spawn(async move {
        waiter.wait().await;
        1u64
    });
    assert_eq!(get(t)?, 1);
    Ok(())
}

#[test]
fn event_broadcasts_to_parked_waiters() -> Result<()> {
    let ev = Arc::new(Event::new());
    let woken = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task<()>> = (0..3)
        .map(|_| {
            let ev = ev.clone();
            let woken = woken.clone();
            spawn(async move {
                ev.wait().await;
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    ev.set();
    assert_eq!(woken.load(Ordering::SeqCst), 3);
    for t in tasks {
        get(t)?;
    }
    Ok(())
}

#[test]
fn event_reset_rearms() -> Result<()> {
    let ev = Arc::new(Event::new());
    ev.set();
    ev.reset();
    let waiter = ev.clone();
    let t = spawn(async move { waiter.wait().await });
    assert!(!t.is_ready());
    ev.set();
    get(t)?;
    Ok(())
}

#[test]
fn event_drop_cancels_queued_waiters() {
    let drops = Arc::new(AtomicUsize::new(0));
    let ev_ptr: *mut Event = Box::into_raw(Box::new(Event::new()));
    let ev: &'static Event = unsafe { &*ev_ptr };
    let counter = drops.clone();
    drop(spawn(async move {
        let _res = Resource(counter);
        ev.wait().await;
    }));
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // Safety: the only outstanding borrow is the parked waiter, which the
    // destructor destroys before the memory is released.
    unsafe { drop(Box::from_raw(ev_ptr)) };
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

// ===== mutex =====

#[test]
fn mutex_try_lock_excludes() {
    let mx = Mutex::new();
    let guard = mx.try_lock().expect("uncontended lock");
    assert!(mx.try_lock().is_none());
    drop(guard);
    assert!(mx.try_lock().is_some());
}

#[test]
fn mutex_hands_the_lock_to_a_parked_waiter() -> Result<()> {
    let mx = Arc::new(Mutex::new());
    let ev = Arc::new(Event::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (m, e, o) = (mx.clone(), ev.clone(), order.clone());
    let holder = spawn(async move {
        let _guard = m.lock().await;
        e.wait().await;
        o.lock().push(1);
    });
    let (m, o) = (mx.clone(), order.clone());
    let contender = spawn(async move {
        let _guard = m.lock().await;
        o.lock().push(2);
    });
    // The contender parked: the holder still owns the lock.
    assert!(order.lock().is_empty());

    ev.set();
    assert_eq!(*order.lock(), vec![1, 2]);
    get(holder)?;
    get(contender)?;
    Ok(())
}

// ===== channel =====

#[test]
fn rendezvous_delivers_in_order_and_closes_empty() -> Result<()> {
    let ch = Arc::new(Channel::<u64>::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let tx = ch.clone();
    let writer = spawn(async move {
        for i in 0..5 {
            assert!(tx.push(i).await, "receiver gone before {i}");
        }
        tx.close();
    });
    let (rx, out) = (ch.clone(), seen.clone());
    let reader = spawn(async move {
        while let Some(v) = rx.pop().await {
            out.lock().push(v);
        }
    });

    get(writer)?;
    get(reader)?;
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn push_fails_once_closed() -> Result<()> {
    let ch = Arc::new(Channel::<u64>::new());
    ch.close();
    let tx = ch.clone();
    let t = spawn(async move { tx.push(7).await });
    assert!(!get(t)?);
    Ok(())
}

#[test]
fn close_wakes_a_parked_popper() -> Result<()> {
    let ch = Arc::new(Channel::<u64>::new());
    let rx = ch.clone();
    let reader = spawn(async move { rx.pop().await });
    assert!(!reader.is_ready());

    ch.close();
    assert_eq!(get(reader)?, None);
    Ok(())
}

#[test]
fn close_wakes_a_parked_pusher() -> Result<()> {
    let ch = Arc::new(Channel::<u64>::new());
    let tx = ch.clone();
    let writer = spawn(async move { tx.push(3).await });
    assert!(!writer.is_ready());

    ch.close();
    assert!(!get(writer)?);
    Ok(())
}

/// Capacity 2: pushes of A and B complete without a receiver, the third
/// value flows through the slot freed by the first pop.
#[test]
fn buffered_sequence_keeps_fifo_without_suspending() -> Result<()> {
    let ch = Arc::new(Channel::<char>::buffered(2));
    let tx = ch.clone();
    // A single frame: any unexpected suspension deadlocks the test.
    let t = spawn(async move {
        assert!(tx.push('a').await);
        assert!(tx.push('b').await);
        assert_eq!(tx.pop().await, Some('a'));
        assert!(tx.push('c').await);
        assert_eq!(tx.pop().await, Some('b'));
        assert_eq!(tx.pop().await, Some('c'));
    });
    get(t)?;
    Ok(())
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
fn buffered_full_parks_the_pusher(#[case] capacity: usize) -> Result<()> {
    let ch = Arc::new(Channel::<usize>::buffered(capacity));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let total = capacity + 3;

    let tx = ch.clone();
    let writer = spawn(async move {
        for i in 0..total {
            assert!(tx.push(i).await);
        }
        tx.close();
    });
    // The writer filled the ring and parked on the overflow push.
    assert!(!writer.is_ready());

    let (rx, out) = (ch.clone(), seen.clone());
    let reader = spawn(async move {
        while let Some(v) = rx.pop().await {
            out.lock().push(v);
        }
    });
    get(writer)?;
    get(reader)?;
    assert_eq!(*seen.lock(), (0..total).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn buffered_close_drains_remaining_values() -> Result<()> {
    let ch = Arc::new(Channel::<u64>::buffered(2));
    let tx = ch.clone();
    get(spawn(async move {
        assert!(tx.push(1).await);
        assert!(tx.push(2).await);
    }))?;
    ch.close();

    let rx = ch.clone();
    let t = spawn(async move {
        let a = rx.pop().await;
        let b = rx.pop().await;
        let end = rx.pop().await;
        (a, b, end)
    });
    assert_eq!(get(t)?, (Some(1), Some(2), None));
    Ok(())
}

#[test]
fn dropped_channel_discards_buffered_values() {
    let drops = Arc::new(AtomicUsize::new(0));
    let ch = Arc::new(Channel::<Resource>::buffered(2));
    let tx = ch.clone();
    let tx2 = ch.clone();
    let counter = drops.clone();
    get(spawn(async move {
        assert!(tx.push(Resource(counter.clone())).await);
        assert!(tx.push(Resource(counter)).await);
    }))
    .unwrap();
    drop(tx2);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(ch);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn channel_across_threads() -> Result<()> {
    let ch = Arc::new(Channel::<u64>::new());
    let tx = ch.clone();
    let producer = std::thread::spawn(move || {
        get(spawn(async move {
            for i in 0..100 {
                assert!(tx.push(i).await);
            }
            tx.close();
        }))
    });
    let rx = ch.clone();
    let sum = spawn(async move {
        let mut sum = 0;
        while let Some(v) = rx.pop().await {
            sum += v;
        }
        sum
    });
    assert_eq!(get(sum)?, (0..100).sum::<u64>());
    producer.join().unwrap()?;
    Ok(())
}

// ===== work group =====

#[test]
fn work_group_completes_on_last_ticket() -> Result<()> {
    let wg: &'static WorkGroup = Box::leak(Box::new(WorkGroup::new()));
    let done = Arc::new(AtomicUsize::new(0));
    let first = wg.create();
    let second = wg.create();
    let third = wg.create();

    let flag = done.clone();
    let waiter = spawn(async move {
        wg.wait().await;
        flag.store(1, Ordering::SeqCst);
    });
    drop(first);
    drop(second);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    drop(third);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    get(waiter)?;
    assert!(wg.is_idle());
    Ok(())
}

#[test]
fn idle_work_group_is_ready_at_once() -> Result<()> {
    let wg: &'static WorkGroup = Box::leak(Box::new(WorkGroup::new()));
    get(spawn(async move { wg.wait().await }))?;
    Ok(())
}

// ===== combinators =====

#[test]
fn when_all_preserves_input_order() -> Result<()> {
    let slots: Vec<HandleSlot> = (0..3).map(|_| HandleSlot::default()).collect();
    let tasks: Vec<Task<u64>> = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| stall(slot.clone(), i as u64 + 1))
        .collect();
    let all = when_all(tasks);
    assert!(!all.is_ready());

    // Completion order differs from input order.
    for i in [2usize, 0, 1] {
        slots[i].lock().take().unwrap().resume();
    }
    let tasks = get(all)?;
    let values: Vec<u64> = tasks.into_iter().map(|t| get(t).unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn when_all_tuple_resolves_both() -> Result<()> {
    let a = spawn(async { 1u64 });
    let b = spawn(async { "two" });
    let (a, b) = get((a, b).when_all())?;
    assert_eq!(get(a)?, 1);
    assert_eq!(get(b)?, "two");
    Ok(())
}

#[test]
fn when_any_prefers_a_synchronously_ready_child() -> Result<()> {
    let slot = HandleSlot::default();
    let ready = spawn(async { 42u64 });
    let stalled = stall(slot.clone(), 0);

    let result = get((ready, stalled).when_any())?;
    assert_eq!(result.index, 0);
    let (ready, stalled) = result.tasks;
    assert_eq!(get(ready)?, 42);

    // The loser is still pending; clean its producer up.
    assert!(!stalled.is_ready());
    drop(stalled);
    slot.lock().take().unwrap().destroy();
    Ok(())
}

#[test]
fn when_any_reports_the_first_to_finish() -> Result<()> {
    let slots: Vec<HandleSlot> = (0..2).map(|_| HandleSlot::default()).collect();
    let tasks: Vec<Task<u64>> = slots
        .iter()
        .map(|slot| stall(slot.clone(), 7))
        .collect();
    let any = when_any(tasks);
    assert!(!any.is_ready());

    slots[1].lock().take().unwrap().resume();
    let result = get(any)?;
    assert_eq!(result.index, 1);

    let mut tasks = result.tasks;
    assert_eq!(get(tasks.pop().unwrap())?, 7);
    // Child 0 is still parked; finish it before extraction.
    slots[0].lock().take().unwrap().resume();
    assert_eq!(get(tasks.pop().unwrap())?, 7);
    Ok(())
}

#[test]
fn when_any_of_nothing_completes_with_max_index() -> Result<()> {
    let result = get(when_any(Vec::<Task<u64>>::new()))?;
    assert_eq!(result.index, usize::MAX);
    assert!(result.tasks.is_empty());
    Ok(())
}

#[test]
fn when_ready_leaves_the_result_in_place() -> Result<()> {
    let t = spawn(async { 5u64 });
    get(spawn(async move {
        when_ready(&t).await;
        t.await
    }))
    .map(|v| assert_eq!(v, 5))?;
    Ok(())
}
