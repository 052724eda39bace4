#![allow(unsafe_op_in_unsafe_fn)]

use std::any::Any;
use std::cell::UnsafeCell;
use std::mem;
use std::panic;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::chain::{self, Chained};
use crate::frame::{Complete, RawFrame};
use crate::join::FollowOutcome;

/// Tri-state result slot of a task.
pub(crate) enum Outcome<T> {
    Pending,
    Value(T),
    Panicked(Box<dyn Any + Send>),
}

/// Heap state jointly owned by a producer frame and a [`Task`] handle.
///
/// `then` encodes ownership and the waiter in one word:
/// - the state's own address: producer alive, no waiter;
/// - null: finalized, or the handle abandoned the task;
/// - anything else: the parked waiter's [`Chained`] node.
///
/// Whoever swaps `then` and reads null learns it is the last owner and must
/// free the state; extraction by a resumed waiter frees it directly. This
/// is the one-bit last-owner test: no reference count.
///
/// [`Task`]: crate::Task
pub(crate) struct RawState<T> {
    then: AtomicPtr<()>,
    outcome: UnsafeCell<Outcome<T>>,
}

unsafe impl<T: Send> Send for RawState<T> {}
unsafe impl<T: Send> Sync for RawState<T> {}

impl<T> RawState<T> {
    pub(crate) fn allocate() -> NonNull<RawState<T>> {
        let state = NonNull::from(Box::leak(Box::new(RawState {
            then: AtomicPtr::new(ptr::null_mut()),
            outcome: UnsafeCell::new(Outcome::Pending),
        })));
        unsafe { state.as_ref() }
            .then
            .store(Self::sentinel(state), Ordering::Relaxed);
        state
    }

    fn sentinel(me: NonNull<Self>) -> *mut () {
        me.as_ptr().cast()
    }

    pub(crate) unsafe fn dealloc(me: NonNull<Self>) {
        drop(Box::from_raw(me.as_ptr()));
    }

    /// Stores the producer's result. Must happen-before [`finalize`],
    /// which publishes it with its release swap on `then`.
    ///
    /// [`finalize`]: RawState::finalize
    pub(crate) unsafe fn put(me: NonNull<Self>, outcome: Outcome<T>) {
        *me.as_ref().outcome.get() = outcome;
    }

    pub(crate) unsafe fn is_ready(me: NonNull<Self>) -> bool {
        me.as_ref().then.load(Ordering::Acquire).is_null()
            && !matches!(&*me.as_ref().outcome.get(), Outcome::Pending)
    }

    /// Producer finalization. Resumes (result present) or destroys
    /// (cancelled) a parked waiter through the chain scheduler. Returns
    /// false when the handle is already gone and the caller must free the
    /// state.
    pub(crate) unsafe fn finalize(me: NonNull<Self>) -> bool {
        let prior = me.as_ref().then.swap(ptr::null_mut(), Ordering::AcqRel);
        if prior == Self::sentinel(me) {
            return true;
        }
        if prior.is_null() {
            // The handle was dropped; nobody will read the result.
            return false;
        }
        let node = NonNull::new_unchecked(prior.cast::<Chained>());
        if matches!(&*me.as_ref().outcome.get(), Outcome::Pending) {
            tracing::trace!("task cancelled; destroying its waiter");
            chain::schedule_destroy(node);
        } else {
            chain::schedule_resume(node);
        }
        true
    }

    /// Handle drop without extraction.
    pub(crate) unsafe fn release(me: NonNull<Self>) {
        let prior = me.as_ref().then.swap(ptr::null_mut(), Ordering::Acquire);
        if prior.is_null() {
            // Producer finalized earlier; we are the last owner.
            Self::dealloc(me);
        } else if prior != Self::sentinel(me) {
            // A waiter is still parked (an abandoned timed wait); cancel
            // it. The producer will observe null and free the state.
            chain::schedule_destroy(NonNull::new_unchecked(prior.cast()));
        }
    }

    /// Attempts to install `node` as the waiter.
    pub(crate) unsafe fn follow(me: NonNull<Self>, node: NonNull<Chained>) -> FollowOutcome {
        let then = &me.as_ref().then;
        let mut prior = Self::sentinel(me);
        match then.compare_exchange(
            prior,
            node.as_ptr().cast(),
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => return FollowOutcome::Parked,
            Err(actual) => prior = actual,
        }
        if !prior.is_null() {
            // An earlier waiter exists. That is only legal when a
            // `when_any` adapter is being superseded; cancel it and take
            // its place.
            match then.compare_exchange(
                prior,
                node.as_ptr().cast(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    chain::schedule_destroy(NonNull::new_unchecked(prior.cast()));
                    return FollowOutcome::Parked;
                }
                Err(actual) => {
                    debug_assert!(actual.is_null(), "multiple frames awaiting the same task");
                }
            }
        }
        if matches!(&*me.as_ref().outcome.get(), Outcome::Pending) {
            FollowOutcome::Gone
        } else {
            FollowOutcome::Ready
        }
    }

    /// Extracts the result and frees the state. Re-raises the producer's
    /// panic, if any.
    pub(crate) unsafe fn take(me: NonNull<Self>) -> T {
        let outcome = mem::replace(&mut *me.as_ref().outcome.get(), Outcome::Pending);
        Self::dealloc(me);
        match outcome {
            Outcome::Value(value) => value,
            Outcome::Panicked(payload) => panic::resume_unwind(payload),
            Outcome::Pending => unreachable!("task extracted before completion"),
        }
    }
}

/// Routes a producer frame's end into its [`RawState`].
pub(crate) struct TaskComplete<T> {
    pub(crate) state: NonNull<RawState<T>>,
}

unsafe impl<T: Send> Send for TaskComplete<T> {}

impl<T> TaskComplete<T> {
    unsafe fn finish(self, frame: RawFrame, outcome: Outcome<T>) {
        RawState::put(self.state, outcome);
        // The frame goes first: the state is a separate allocation and the
        // waiter resumed by finalize never touches the producer again.
        frame.dealloc();
        if !RawState::finalize(self.state) {
            RawState::dealloc(self.state);
        }
    }
}

impl<T> Complete<T> for TaskComplete<T> {
    unsafe fn complete(self, frame: RawFrame, value: T) {
        self.finish(frame, Outcome::Value(value));
    }

    unsafe fn panicked(self, frame: RawFrame, payload: Box<dyn Any + Send>) {
        self.finish(frame, Outcome::Panicked(payload));
    }

    unsafe fn cancel(self, frame: RawFrame) {
        self.finish(frame, Outcome::Pending);
    }
}

/// Best-effort text of a panic payload, for the paths that cannot carry
/// the payload itself (shared tasks).
pub(crate) fn panic_payload_as_str(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "task panicked"
    }
}
