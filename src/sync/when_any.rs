use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::frame::{context, RawHandle};
use crate::join::{FollowFut, Follower, Join};
use crate::task::{spawn, spawn_detached_inner, Task};

/// Result of [`when_any`]: the position of the first child to become ready
/// and the children themselves, results still inside.
pub struct WhenAny<S> {
    pub index: usize,
    pub tasks: S,
}

/// Produces a task yielding `{index, tasks}` for the first element of
/// `tasks` to become ready.
///
/// A child that is already ready short-circuits: later children are not
/// even watched. Otherwise one detached adapter frame parks per child; the
/// first to fire wins and the rest are cancelled when their children
/// resolve or are dropped. An empty input completes at once with
/// `index == usize::MAX`.
pub fn when_any<J>(tasks: Vec<J>) -> Task<WhenAny<Vec<J>>>
where
    J: Join + Send + 'static,
{
    let followers: Vec<Follower> = tasks.iter().map(Join::follower).collect();
    when_any_impl(tasks, followers)
}

pub(crate) fn when_any_impl<S>(tasks: S, followers: Vec<Follower>) -> Task<WhenAny<S>>
where
    S: Send + 'static,
{
    let state = Arc::new(AnyState {
        coro: AtomicPtr::new(ptr::null_mut()),
        result: UnsafeCell::new(Some(WhenAny { index: 0, tasks })),
    });
    // The producer parks itself during this spawn; every set_ready after
    // this line finds it.
    let ret = spawn(ParkAny {
        state: NonNull::from(&*state),
        parked: false,
    });
    if followers.is_empty() {
        state.set_ready(usize::MAX);
        return ret;
    }
    for (index, follower) in followers.into_iter().enumerate() {
        if try_any_at(&state, index, follower) {
            break;
        }
        if state.coro.load(Ordering::Relaxed).is_null() {
            // A child fired while we were still spawning adapters.
            break;
        }
    }
    ret
}

/// Fast-path a ready child, or leave an adapter frame watching it.
/// Returns true when the child was ready and won.
fn try_any_at<S>(state: &Arc<AnyState<S>>, index: usize, follower: Follower) -> bool
where
    S: Send + 'static,
{
    if follower.is_ready() {
        state.set_ready(index);
        return true;
    }
    spawn_detached_inner(AnyAdapter {
        state: state.clone(),
        index,
        fut: FollowFut::new(follower),
    });
    false
}

/// Shared between the producer task and the per-child adapters. `coro`
/// holds the parked producer; the winning `set_ready` swaps it out, stamps
/// the index and resumes it. Dropped when the last adapter goes, which
/// cancels a producer that never got a winner.
struct AnyState<S> {
    coro: AtomicPtr<()>,
    result: UnsafeCell<Option<WhenAny<S>>>,
}

unsafe impl<S: Send> Send for AnyState<S> {}
unsafe impl<S: Send> Sync for AnyState<S> {}

impl<S> AnyState<S> {
    fn set_ready(&self, index: usize) {
        let prior = self.coro.swap(ptr::null_mut(), Ordering::AcqRel);
        if prior.is_null() {
            // Another child already won.
            return;
        }
        unsafe {
            if let Some(result) = (*self.result.get()).as_mut() {
                result.index = index;
            }
            RawHandle(NonNull::new_unchecked(prior.cast())).resume();
        }
    }
}

impl<S> Drop for AnyState<S> {
    fn drop(&mut self) {
        // No winner and no watchers left: cancel the parked producer,
        // which in turn cancels the when_any task.
        if let Some(prior) = NonNull::new(self.coro.load(Ordering::Relaxed)) {
            unsafe { RawHandle(prior.cast()).destroy() };
        }
    }
}

/// Producer future of the `when_any` task: parks, then hands the stamped
/// result out once resumed by the winner.
struct ParkAny<S> {
    /// Not a strong reference: the adapters and the `when_any` call keep
    /// the state alive for as long as this frame can be reached, and the
    /// state itself destroys the parked frame when the last watcher goes.
    state: NonNull<AnyState<S>>,
    parked: bool,
}

unsafe impl<S: Send> Send for ParkAny<S> {}

impl<S> Future for ParkAny<S> {
    type Output = WhenAny<S>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WhenAny<S>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked {
            let result = unsafe { (*this.state.as_ref().result.get()).take() };
            return Poll::Ready(result.expect("when_any result already taken"));
        }
        let me = context::current();
        unsafe { this.state.as_ref() }
            .coro
            .store(me.0.as_ptr().cast(), Ordering::Release);
        this.parked = true;
        Poll::Pending
    }
}

/// Detached frame watching one child; reports its index when the child
/// resolves. Dies silently (dropping its state reference) when the child
/// is cancelled instead.
struct AnyAdapter<S> {
    state: Arc<AnyState<S>>,
    index: usize,
    fut: FollowFut,
}

unsafe impl<S: Send> Send for AnyAdapter<S> {}

impl<S> Future for AnyAdapter<S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = unsafe { self.get_unchecked_mut() };
        // Safety: `fut` is pinned whenever we are.
        match unsafe { Pin::new_unchecked(&mut this.fut) }.poll(cx) {
            Poll::Ready(()) => {
                this.state.set_ready(this.index);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
