use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const CANCELLED: u8 = 3;
const COMPLETE: u8 = 4;

/// Per-frame lifecycle word.
///
/// A frame has a single owner at any time (a primitive's waiter slot, the
/// chain scheduler, or user code holding a [`FrameHandle`]), but a poll can
/// still be unwinding on one thread while the peer that consumed the parked
/// waiter node resumes or destroys the frame from another. `Notified` and
/// `Cancelled` absorb that window: the in-flight poll loop picks the
/// transition up instead of the peer touching the frame.
///
/// [`FrameHandle`]: crate::FrameHandle
pub(crate) struct Lifecycle(AtomicU8);

pub(crate) enum TransitionToRunning {
    /// The caller claimed the frame and must drive the poll loop.
    Ok,
    /// A poll loop is in flight; it will re-poll. Nothing to do.
    Notified,
}

pub(crate) enum TransitionToIdle {
    Ok,
    /// A resume arrived while polling; poll again.
    Repoll,
    /// A destroy arrived while polling; drop the frame.
    Cancelled,
}

pub(crate) enum TransitionToDestroy {
    /// The caller claimed the frame and must drop it.
    Drop,
    /// A poll loop is in flight and will drop the frame itself.
    Deferred,
    /// The frame already completed; only the allocation remains.
    Dealloc,
}

impl Lifecycle {
    pub(crate) fn new() -> Lifecycle {
        Lifecycle(AtomicU8::new(IDLE))
    }

    pub(crate) fn transition_to_running(&self) -> TransitionToRunning {
        let mut curr = self.0.load(Ordering::Acquire);
        loop {
            let (next, res) = match curr {
                IDLE => (RUNNING, TransitionToRunning::Ok),
                RUNNING => (NOTIFIED, TransitionToRunning::Notified),
                state => {
                    debug_assert!(false, "resume on a frame in state {state}");
                    return TransitionToRunning::Notified;
                }
            };
            match self
                .0
                .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return res,
                Err(actual) => curr = actual,
            }
        }
    }

    pub(crate) fn transition_to_idle(&self) -> TransitionToIdle {
        match self
            .0
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => TransitionToIdle::Ok,
            Err(NOTIFIED) => {
                // We still own the frame; fold the notification into the
                // running loop.
                self.0.store(RUNNING, Ordering::Relaxed);
                TransitionToIdle::Repoll
            }
            Err(CANCELLED) => TransitionToIdle::Cancelled,
            Err(state) => unreachable!("idle transition from state {state}"),
        }
    }

    /// Marks the frame complete while its allocation outlives the poll loop
    /// (lazy frames). A later destroy only deallocates.
    pub(crate) fn transition_to_complete(&self) {
        self.0.store(COMPLETE, Ordering::Release);
    }

    pub(crate) fn transition_to_destroy(&self) -> TransitionToDestroy {
        let mut curr = self.0.load(Ordering::Acquire);
        loop {
            let (next, res) = match curr {
                IDLE => (RUNNING, TransitionToDestroy::Drop),
                RUNNING => (CANCELLED, TransitionToDestroy::Deferred),
                COMPLETE => return TransitionToDestroy::Dealloc,
                state => {
                    debug_assert!(false, "destroy on a frame in state {state}");
                    return TransitionToDestroy::Deferred;
                }
            };
            match self
                .0
                .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return res,
                Err(actual) => curr = actual,
            }
        }
    }
}
