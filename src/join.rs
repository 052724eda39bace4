//! The awaitable protocol shared by task-like values.
//!
//! [`Join`] is what the combinators ([`when_all`], [`when_any`]) and the
//! blocking bridge ([`wait`], [`get`]) are generic over. Its hidden methods
//! expose the park/extract protocol through a type-erased [`Follower`] so
//! that adapter frames can keep watching a task after the task value itself
//! has moved (the heap state a `Follower` points at never moves).
//!
//! [`when_all`]: crate::when_all
//! [`when_any`]: crate::when_any
//! [`wait`]: crate::wait
//! [`get`]: crate::get

use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

use crate::chain::Chained;
use crate::frame::context;

/// Result of trying to install a waiter on a task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowOutcome {
    /// The waiter is installed; the producer resumes or destroys it.
    Parked,
    /// The result is already there; extract without suspending.
    Ready,
    /// The producer died without producing; the awaiter must cancel.
    Gone,
}

pub(crate) struct FollowerVtable {
    pub(crate) is_ready: unsafe fn(NonNull<()>) -> bool,
    pub(crate) follow: unsafe fn(NonNull<()>, NonNull<Chained>) -> FollowOutcome,
}

/// Type-erased handle on a task state, valid for as long as the task value
/// it was taken from is alive.
pub struct Follower {
    state: NonNull<()>,
    vtable: &'static FollowerVtable,
}

// Safety: a `Follower` is only constructed by `Join` impls whose states are
// owned, heap-pinned and internally synchronized (`Task`, `SharedTask`,
// `LazyTask`).
unsafe impl Send for Follower {}

impl Follower {
    pub(crate) fn new(state: NonNull<()>, vtable: &'static FollowerVtable) -> Follower {
        Follower { state, vtable }
    }

    pub(crate) fn is_ready(&self) -> bool {
        unsafe { (self.vtable.is_ready)(self.state) }
    }

    pub(crate) fn follow(&self, node: NonNull<Chained>) -> FollowOutcome {
        unsafe { (self.vtable.follow)(self.state, node) }
    }
}

/// An asynchronous value that can be watched for readiness and extracted.
///
/// Implemented by [`Task`], [`SharedTask`] and [`LazyTask`].
///
/// [`Task`]: crate::Task
/// [`SharedTask`]: crate::SharedTask
/// [`LazyTask`]: crate::LazyTask
pub trait Join {
    type Output;

    /// True once the result can be extracted without suspending.
    fn is_ready(&self) -> bool;

    #[doc(hidden)]
    fn follower(&self) -> Follower;

    /// Extracts the result. Only valid once [`is_ready`](Join::is_ready)
    /// holds; panics (or re-raises the producer's panic) otherwise.
    #[doc(hidden)]
    fn take(&mut self) -> Self::Output;
}

/// Future that parks the current frame on a [`Follower`] and completes when
/// the watched task resolves, without extracting its value.
pub(crate) struct FollowFut {
    follower: Follower,
    node: Chained,
    parked: bool,
    _pin: PhantomPinned,
}

// Safety: the intrusive node is only shared while parked, and the handoff
// back is synchronized by the task state's atomic `then` slot.
unsafe impl Send for FollowFut {}

impl FollowFut {
    pub(crate) fn new(follower: Follower) -> FollowFut {
        FollowFut {
            follower,
            node: Chained::idle(),
            parked: false,
            _pin: PhantomPinned,
        }
    }
}

impl Future for FollowFut {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // Safety: the node address must stay stable while parked; the pin
        // contract guarantees it.
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked || this.follower.is_ready() {
            return Poll::Ready(());
        }
        this.node.coro = context::current();
        match this.follower.follow(NonNull::from(&mut this.node)) {
            FollowOutcome::Parked => {
                this.parked = true;
                Poll::Pending
            }
            FollowOutcome::Ready => Poll::Ready(()),
            FollowOutcome::Gone => {
                context::request_cancel();
                Poll::Pending
            }
        }
    }
}

/// Awaits readiness of `task` by reference, discarding nothing: the result
/// stays inside `task` for later extraction.
pub fn when_ready<J: Join>(task: &J) -> WhenReady<'_, J> {
    WhenReady {
        fut: FollowFut::new(task.follower()),
        _marker: std::marker::PhantomData,
    }
}

/// Awaitable returned by [`when_ready`].
pub struct WhenReady<'a, J> {
    fut: FollowFut,
    _marker: std::marker::PhantomData<fn() -> &'a J>,
}

impl<J: Join> Future for WhenReady<'_, J> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: structural projection; `fut` is pinned whenever we are.
        unsafe { self.map_unchecked_mut(|w| &mut w.fut) }.poll(cx)
    }
}
