use super::*;
use crate::{spawn, suspend, FrameHandle, Task};
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type HandleSlot = Arc<parking_lot::Mutex<Option<FrameHandle>>>;

fn stall(slot: HandleSlot) -> Task<u64> {
    spawn(async move {
        suspend(move |handle| *slot.lock() = Some(handle)).await;
        0
    })
}

#[test]
fn wait_on_a_ready_task_returns_at_once() -> Result<()> {
    let t = spawn(async { 1u64 });
    wait(&t)?;
    assert_eq!(get(t)?, 1);
    Ok(())
}

#[test]
fn waiting_a_cancelled_task_reports_canceled() {
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    slot.lock().take().unwrap().destroy();
    assert_eq!(wait(&t), Err(Canceled));
    assert_eq!(get(t), Err(Canceled));
}

#[test]
fn cancellation_during_a_blocked_wait() {
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        slot.lock().take().unwrap().destroy();
    });
    assert_eq!(wait(&t), Err(Canceled));
    killer.join().unwrap();
}

#[test]
fn timed_wait_times_out_and_the_task_survives() -> Result<()> {
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    assert!(!wait_for(&t, Duration::from_millis(10))?);

    // The timeout left the task untouched; it still completes.
    slot.lock().take().unwrap().resume();
    assert_eq!(get(t)?, 0);
    Ok(())
}

#[test]
fn timed_wait_completes_before_the_deadline() -> Result<()> {
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        slot.lock().take().unwrap().resume();
    });
    assert!(wait_for(&t, Duration::from_secs(5))?);
    assert_eq!(get(t)?, 0);
    waker.join().unwrap();
    Ok(())
}

#[test]
fn dropping_a_task_with_an_abandoned_timed_wait_is_clean() -> Result<()> {
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    assert!(!wait_for(&t, Duration::from_millis(5))?);
    // The driver is still parked on the task; dropping the handle cancels
    // it and the producer later finalizes as last owner.
    drop(t);
    slot.lock().take().unwrap().destroy();
    Ok(())
}

#[test]
fn get_extracts_through_the_bridge() -> Result<()> {
    let slot = HandleSlot::default();
    let t = stall(slot.clone());
    slot.lock().take().unwrap().resume();
    assert_eq!(get(t)?, 0);
    Ok(())
}
