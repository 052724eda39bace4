//! Bridges awaitables into blocking calls.
//!
//! A driver frame parks on the awaitable; its completion (or cancellation)
//! signals a condvar the calling thread blocks on. The timed variants share
//! that state between driver and caller, so a timeout can return while the
//! driver stays parked; the underlying awaitable is not disturbed and can
//! be waited on or extracted later.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::frame::{self, Complete, RawFrame};
use crate::join::{FollowFut, Join};

/// The awaited producer was destroyed before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct Canceled;

#[derive(Default)]
struct Flags {
    ready: bool,
    returned: bool,
}

struct BlockingState {
    lock: Mutex<Flags>,
    cond: Condvar,
}

impl BlockingState {
    fn new() -> BlockingState {
        BlockingState {
            lock: Mutex::new(Flags::default()),
            cond: Condvar::new(),
        }
    }

    fn finish(&self, returned: bool) {
        let mut flags = self.lock.lock();
        flags.ready = true;
        flags.returned = returned;
        drop(flags);
        self.cond.notify_one();
    }

    fn wait(&self) -> Result<(), Canceled> {
        let mut flags = self.lock.lock();
        while !flags.ready {
            self.cond.wait(&mut flags);
        }
        if flags.returned { Ok(()) } else { Err(Canceled) }
    }

    /// None on timeout.
    fn wait_until(&self, deadline: Instant) -> Option<Result<(), Canceled>> {
        let mut flags = self.lock.lock();
        while !flags.ready {
            if self.cond.wait_until(&mut flags, deadline).timed_out() && !flags.ready {
                return None;
            }
        }
        Some(if flags.returned { Ok(()) } else { Err(Canceled) })
    }
}

struct DriverComplete {
    state: Arc<BlockingState>,
}

impl Complete<()> for DriverComplete {
    unsafe fn complete(self, frame: RawFrame, _: ()) {
        unsafe { frame.dealloc() };
        self.state.finish(true);
    }

    unsafe fn panicked(self, frame: RawFrame, _payload: Box<dyn std::any::Any + Send>) {
        // The driver future only parks; it has no user code to panic.
        unsafe { frame.dealloc() };
        tracing::error!("blocking driver panicked");
        std::process::abort();
    }

    unsafe fn cancel(self, frame: RawFrame) {
        unsafe { frame.dealloc() };
        self.state.finish(false);
    }
}

fn spawn_driver<J: Join>(task: &J) -> Arc<BlockingState> {
    let state = Arc::new(BlockingState::new());
    frame::allocate(
        FollowFut::new(task.follower()),
        DriverComplete {
            state: state.clone(),
        },
    )
    .resume();
    state
}

/// Blocks the calling thread until `task` is ready.
///
/// Returns [`Canceled`] when the producer was (or gets) destroyed without
/// completing.
pub fn wait<J: Join>(task: &J) -> Result<(), Canceled> {
    if task.is_ready() {
        return Ok(());
    }
    spawn_driver(task).wait()
}

/// Blocks until `task` is ready or `deadline` passes.
///
/// `Ok(true)` = ready, `Ok(false)` = timed out (the task is unaffected and
/// continues independently), `Err(Canceled)` = producer destroyed.
pub fn wait_until<J: Join>(task: &J, deadline: Instant) -> Result<bool, Canceled> {
    if task.is_ready() {
        return Ok(true);
    }
    match spawn_driver(task).wait_until(deadline) {
        Some(done) => done.map(|()| true),
        None => Ok(false),
    }
}

/// [`wait_until`] with a relative timeout.
pub fn wait_for<J: Join>(task: &J, timeout: Duration) -> Result<bool, Canceled> {
    wait_until(task, Instant::now() + timeout)
}

/// Blocks until `task` is ready and extracts its result, re-raising the
/// producer's panic if it failed.
pub fn get<J: Join>(mut task: J) -> Result<J::Output, Canceled> {
    wait(&task)?;
    Ok(task.take())
}

#[cfg(test)]
mod tests;
