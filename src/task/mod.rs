//! Single-owner asynchronous values.

pub(crate) mod lazy;
pub(crate) mod shared;
pub(crate) mod state;

pub use self::lazy::{lazy, LazyTask};
pub use self::shared::{spawn_shared, SharedTask};

use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::task::{Context, Poll};

use crate::chain::Chained;
use crate::frame::{self, context, Complete, RawFrame};
use crate::join::{Follower, FollowerVtable, FollowOutcome, Join};
use crate::task::state::{RawState, TaskComplete};

/// Starts `future` eagerly in its own frame and returns the handle to its
/// eventual result.
///
/// The producer runs on the spawning thread until its first suspension;
/// afterwards it resumes on whatever thread wakes it. Awaiting the returned
/// [`Task`] yields the result (re-raising the producer's panic, if any).
/// Dropping the `Task` cancels the producer: once it can make no further
/// progress its frame is destroyed and the destructors of its locals run,
/// cancelling in turn everything it was awaiting.
///
/// Only this crate's awaitables (and futures composed of them) may be
/// awaited inside the producer; frames poll with a no-op waker, so futures
/// that rely on waker-based scheduling never wake up.
pub fn spawn<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let state = RawState::allocate();
    let handle = frame::allocate(future, TaskComplete { state });
    tracing::trace!("spawning task");
    handle.resume();
    Task {
        state: Some(state),
        node: Chained::idle(),
        parked: false,
        _pin: PhantomPinned,
    }
}

/// Starts `future` in a fire-and-forget frame.
///
/// Nothing observes the result; a panic escaping the frame aborts the
/// process.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    frame::allocate(future, DetachedComplete).resume();
}

pub(crate) fn spawn_detached_inner<F>(future: F)
where
    F: Future<Output = ()>,
{
    frame::allocate(future, DetachedComplete).resume();
}

struct DetachedComplete;

impl Complete<()> for DetachedComplete {
    unsafe fn complete(self, frame: RawFrame, _: ()) {
        unsafe { frame.dealloc() };
    }

    unsafe fn panicked(self, frame: RawFrame, payload: Box<dyn std::any::Any + Send>) {
        unsafe { frame.dealloc() };
        tracing::error!(
            "detached frame panicked: {}",
            state::panic_payload_as_str(&payload)
        );
        std::process::abort();
    }

    unsafe fn cancel(self, frame: RawFrame) {
        unsafe { frame.dealloc() };
    }
}

/// Handle to an eagerly-started asynchronous computation.
///
/// Move-only. At most one frame may await a `Task` at a time.
pub struct Task<T> {
    state: Option<NonNull<RawState<T>>>,
    node: Chained,
    parked: bool,
    _pin: PhantomPinned,
}

// Safety: the state is internally synchronized; the intrusive node is only
// shared while parked and handed back through the state's atomic slot.
unsafe impl<T: Send> Send for Task<T> {}

impl<T> Task<T> {
    /// Converts into a [`SharedTask`], allowing multiple owners and
    /// awaiters.
    pub fn share(self) -> SharedTask<T>
    where
        T: Send + 'static,
    {
        spawn_shared(self)
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        // Safety: nothing is moved out; the node address is pin-stable.
        let this = unsafe { self.get_unchecked_mut() };
        let state = this.state.expect("task polled after extraction");
        if this.parked || unsafe { RawState::is_ready(state) } {
            this.state = None;
            return Poll::Ready(unsafe { RawState::take(state) });
        }
        this.node.coro = context::current();
        this.node.next = ptr::null_mut();
        match unsafe { RawState::follow(state, NonNull::from(&mut this.node)) } {
            FollowOutcome::Parked => {
                this.parked = true;
                Poll::Pending
            }
            FollowOutcome::Ready => {
                this.state = None;
                Poll::Ready(unsafe { RawState::take(state) })
            }
            FollowOutcome::Gone => {
                // The producer died without a result; cancellation flows
                // into the awaiting frame.
                context::request_cancel();
                Poll::Pending
            }
        }
    }
}

impl<T> Join for Task<T> {
    type Output = T;

    fn is_ready(&self) -> bool {
        match self.state {
            Some(state) => unsafe { RawState::is_ready(state) },
            None => true,
        }
    }

    fn follower(&self) -> Follower {
        let state = self.state.expect("task already extracted");
        Follower::new(state.cast(), follower_vtable::<T>())
    }

    fn take(&mut self) -> T {
        let state = self.state.take().expect("task already extracted");
        unsafe { RawState::take(state) }
    }
}

fn follower_vtable<T>() -> &'static FollowerVtable {
    unsafe fn is_ready_raw<T>(state: NonNull<()>) -> bool {
        unsafe { RawState::is_ready(state.cast::<RawState<T>>()) }
    }
    unsafe fn follow_raw<T>(state: NonNull<()>, node: NonNull<Chained>) -> FollowOutcome {
        unsafe { RawState::follow(state.cast::<RawState<T>>(), node) }
    }
    &FollowerVtable {
        is_ready: is_ready_raw::<T>,
        follow: follow_raw::<T>,
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            unsafe { RawState::release(state) };
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Task")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests;
