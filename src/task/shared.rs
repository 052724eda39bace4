#![allow(unsafe_op_in_unsafe_fn)]

use std::any::Any;
use std::cell::UnsafeCell;
use std::future::Future;
use std::marker::PhantomPinned;
use std::panic;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicPtr, AtomicU32, Ordering};
use std::task::{Context, Poll};

use crate::chain::{self, Chained};
use crate::frame::{self, context, Complete, RawFrame};
use crate::join::{Follower, FollowerVtable, FollowOutcome, Join};
use crate::task::state::panic_payload_as_str;
use crate::task::Task;

enum SharedOutcome<T> {
    Pending,
    Value(T),
    /// Panic payloads are not cloneable; shared awaiters re-raise the
    /// message instead.
    Panicked(String),
}

/// State of a [`SharedTask`]: like the unique task state, but reference
/// counted (producer + handles) and with a Treiber stack of waiter nodes in
/// `then`, terminated by the self-sentinel while the producer is alive.
struct SharedState<T> {
    then: AtomicPtr<()>,
    refs: AtomicU32,
    outcome: UnsafeCell<SharedOutcome<T>>,
}

unsafe impl<T: Send> Send for SharedState<T> {}
unsafe impl<T: Send> Sync for SharedState<T> {}

impl<T> SharedState<T> {
    fn allocate() -> NonNull<SharedState<T>> {
        let state = NonNull::from(Box::leak(Box::new(SharedState {
            then: AtomicPtr::new(ptr::null_mut()),
            // Producer + the first handle.
            refs: AtomicU32::new(2),
            outcome: UnsafeCell::new(SharedOutcome::Pending),
        })));
        unsafe { state.as_ref() }
            .then
            .store(Self::sentinel(state), Ordering::Relaxed);
        state
    }

    fn sentinel(me: NonNull<Self>) -> *mut () {
        me.as_ptr().cast()
    }

    unsafe fn dealloc(me: NonNull<Self>) {
        drop(Box::from_raw(me.as_ptr()));
    }

    unsafe fn retain(me: NonNull<Self>) {
        me.as_ref().refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one owner; frees the state when it was the last.
    unsafe fn release(me: NonNull<Self>) {
        if me.as_ref().refs.fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            Self::dealloc(me);
        }
    }

    unsafe fn is_ready(me: NonNull<Self>) -> bool {
        me.as_ref().then.load(Ordering::Acquire).is_null()
            && !matches!(&*me.as_ref().outcome.get(), SharedOutcome::Pending)
    }

    /// Drains the waiter stack (resume on a result, destroy on
    /// cancellation) and drops the producer's reference.
    unsafe fn finalize(me: NonNull<Self>) {
        let mut next = me.as_ref().then.swap(ptr::null_mut(), Ordering::AcqRel);
        let resume = !matches!(&*me.as_ref().outcome.get(), SharedOutcome::Pending);
        while next != Self::sentinel(me) {
            let node = NonNull::new_unchecked(next.cast::<Chained>());
            next = node.as_ref().next;
            if resume {
                chain::schedule_resume(node);
            } else {
                chain::schedule_destroy(node);
            }
        }
        Self::release(me);
    }

    unsafe fn follow(me: NonNull<Self>, node: NonNull<Chained>) -> FollowOutcome {
        let then = &me.as_ref().then;
        let mut head = then.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return if matches!(&*me.as_ref().outcome.get(), SharedOutcome::Pending) {
                    FollowOutcome::Gone
                } else {
                    FollowOutcome::Ready
                };
            }
            (*node.as_ptr()).next = head;
            match then.compare_exchange_weak(
                head,
                node.as_ptr().cast(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return FollowOutcome::Parked,
                Err(actual) => head = actual,
            }
        }
    }

    /// Clones the stored value out, re-raising a recorded panic.
    unsafe fn get(me: NonNull<Self>) -> T
    where
        T: Clone,
    {
        match &*me.as_ref().outcome.get() {
            SharedOutcome::Value(value) => value.clone(),
            SharedOutcome::Panicked(msg) => panic::resume_unwind(Box::new(msg.clone())),
            SharedOutcome::Pending => unreachable!("shared task read before completion"),
        }
    }
}

/// Starts `future` eagerly and returns a copyable handle to its result.
///
/// Every clone observes the same stored value; awaiting yields a clone of
/// it. The state is freed when the last handle is dropped (and the
/// producer has finalized).
pub fn spawn_shared<F>(future: F) -> SharedTask<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let state = SharedState::allocate();
    let handle = frame::allocate(future, SharedComplete { state });
    tracing::trace!("spawning shared task");
    handle.resume();
    SharedTask {
        state: Some(state),
        node: Chained::idle(),
        parked: false,
        _pin: PhantomPinned,
    }
}

struct SharedComplete<T> {
    state: NonNull<SharedState<T>>,
}

unsafe impl<T: Send> Send for SharedComplete<T> {}

impl<T> SharedComplete<T> {
    unsafe fn finish(self, frame: RawFrame, outcome: SharedOutcome<T>) {
        *self.state.as_ref().outcome.get() = outcome;
        frame.dealloc();
        SharedState::finalize(self.state);
    }
}

impl<T> Complete<T> for SharedComplete<T> {
    unsafe fn complete(self, frame: RawFrame, value: T) {
        self.finish(frame, SharedOutcome::Value(value));
    }

    unsafe fn panicked(self, frame: RawFrame, payload: Box<dyn Any + Send>) {
        let msg = panic_payload_as_str(&payload).to_owned();
        self.finish(frame, SharedOutcome::Panicked(msg));
    }

    unsafe fn cancel(self, frame: RawFrame) {
        self.finish(frame, SharedOutcome::Pending);
    }
}

/// Copyable handle to an eagerly-started asynchronous computation.
///
/// Awaiting yields a clone of the stored value; any number of clones may
/// await concurrently.
pub struct SharedTask<T> {
    state: Option<NonNull<SharedState<T>>>,
    node: Chained,
    parked: bool,
    _pin: PhantomPinned,
}

unsafe impl<T: Send> Send for SharedTask<T> {}
unsafe impl<T: Send> Sync for SharedTask<T> {}

impl<T> Clone for SharedTask<T> {
    fn clone(&self) -> SharedTask<T> {
        if let Some(state) = self.state {
            unsafe { SharedState::retain(state) };
        }
        SharedTask {
            state: self.state,
            node: Chained::idle(),
            parked: false,
            _pin: PhantomPinned,
        }
    }
}

impl<T> Drop for SharedTask<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            unsafe { SharedState::release(state) };
        }
    }
}

impl<T> From<Task<T>> for SharedTask<T>
where
    T: Send + 'static,
{
    fn from(task: Task<T>) -> SharedTask<T> {
        task.share()
    }
}

impl<T: Clone> Future for SharedTask<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        // Safety: nothing is moved out; the node address is pin-stable.
        let this = unsafe { self.get_unchecked_mut() };
        let state = this.state.expect("shared task polled after drop");
        if this.parked || unsafe { SharedState::is_ready(state) } {
            this.parked = false;
            return Poll::Ready(unsafe { SharedState::get(state) });
        }
        this.node.coro = context::current();
        match unsafe { SharedState::follow(state, NonNull::from(&mut this.node)) } {
            FollowOutcome::Parked => {
                this.parked = true;
                Poll::Pending
            }
            FollowOutcome::Ready => Poll::Ready(unsafe { SharedState::get(state) }),
            FollowOutcome::Gone => {
                context::request_cancel();
                Poll::Pending
            }
        }
    }
}

impl<T: Clone> Join for SharedTask<T> {
    type Output = T;

    fn is_ready(&self) -> bool {
        match self.state {
            Some(state) => unsafe { SharedState::is_ready(state) },
            None => false,
        }
    }

    fn follower(&self) -> Follower {
        let state = self.state.expect("shared task already dropped");
        Follower::new(state.cast(), shared_follower_vtable::<T>())
    }

    fn take(&mut self) -> T {
        let state = self.state.expect("shared task already dropped");
        unsafe { SharedState::get(state) }
    }
}

fn shared_follower_vtable<T>() -> &'static FollowerVtable {
    unsafe fn is_ready_raw<T>(state: NonNull<()>) -> bool {
        unsafe { SharedState::is_ready(state.cast::<SharedState<T>>()) }
    }
    unsafe fn follow_raw<T>(state: NonNull<()>, node: NonNull<Chained>) -> FollowOutcome {
        unsafe { SharedState::follow(state.cast::<SharedState<T>>(), node) }
    }
    &FollowerVtable {
        is_ready: is_ready_raw::<T>,
        follow: follow_raw::<T>,
    }
}
