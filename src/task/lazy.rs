#![allow(unsafe_op_in_unsafe_fn)]

use std::any::Any;
use std::cell::Cell;
use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

use crate::frame::{self, context, Complete, RawFrame, RawHandle};
use crate::join::{Follower, FollowerVtable, FollowOutcome, Join};
use crate::task::state::Outcome;

/// State box of a [`LazyTask`]: result slot plus the single consumer slot.
///
/// No atomics: producer and consumer are serialized by the await itself
/// (the consumer parks, then resumes the producer; the producer reads the
/// slot only once running).
struct LazyCore<T> {
    outcome: Cell<Outcome<T>>,
    consumer: Cell<Option<RawHandle>>,
    producer: Cell<Option<RawHandle>>,
}

unsafe impl<T: Send> Send for LazyCore<T> {}
unsafe impl<T: Send> Sync for LazyCore<T> {}

impl<T> LazyCore<T> {
    unsafe fn dealloc(me: NonNull<Self>) {
        drop(Box::from_raw(me.as_ptr()));
    }

    unsafe fn is_done(me: NonNull<Self>) -> bool {
        let outcome = me.as_ref().outcome.replace(Outcome::Pending);
        let done = !matches!(outcome, Outcome::Pending);
        me.as_ref().outcome.set(outcome);
        done
    }

    /// Parks `consumer` and starts (or resumes) the producer. The producer
    /// frame resumes the stored consumer when it completes.
    unsafe fn start(me: NonNull<Self>, consumer: RawHandle) {
        let prev = me.as_ref().consumer.replace(Some(consumer));
        debug_assert!(prev.is_none(), "lazy task awaited twice");
        let producer = me
            .as_ref()
            .producer
            .take()
            .expect("lazy producer already started");
        producer.resume();
    }

    unsafe fn take(me: NonNull<Self>) -> T {
        match me.as_ref().outcome.replace(Outcome::Pending) {
            Outcome::Value(value) => value,
            Outcome::Panicked(payload) => panic::resume_unwind(payload),
            Outcome::Pending => unreachable!("lazy task read before completion"),
        }
    }
}

/// Creates a producer-driven task: `future` is allocated now but only
/// starts on the first await.
///
/// Single consumer; the [`LazyTask`] owns the producer frame and destroys
/// it on drop or after extraction.
pub fn lazy<F>(future: F) -> LazyTask<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let core = NonNull::from(Box::leak(Box::new(LazyCore {
        outcome: Cell::new(Outcome::Pending),
        consumer: Cell::new(None),
        producer: Cell::new(None),
    })));
    let handle = frame::allocate(future, LazyComplete { core });
    unsafe { core.as_ref() }.producer.set(Some(handle));
    LazyTask {
        core: Some(core),
        frame: handle,
        parked: false,
    }
}

struct LazyComplete<T> {
    core: NonNull<LazyCore<T>>,
}

unsafe impl<T: Send> Send for LazyComplete<T> {}

impl<T> LazyComplete<T> {
    unsafe fn finish(self, frame: RawFrame, outcome: Outcome<T>) {
        self.core.as_ref().outcome.set(outcome);
        // The owner reaps the allocation; the result has to outlive the
        // poll loop that produced it.
        frame.keep();
        if let Some(consumer) = self.core.as_ref().consumer.take() {
            consumer.resume();
        }
    }
}

impl<T> Complete<T> for LazyComplete<T> {
    unsafe fn complete(self, frame: RawFrame, value: T) {
        self.finish(frame, Outcome::Value(value));
    }

    unsafe fn panicked(self, frame: RawFrame, payload: Box<dyn Any + Send>) {
        self.finish(frame, Outcome::Panicked(payload));
    }

    unsafe fn cancel(self, frame: RawFrame) {
        // Destroyed by the owner before completing; the allocation goes
        // with it. A consumer cannot be parked here: it would own us.
        unsafe { frame.dealloc() };
    }
}

/// Handle to a producer-driven, single-consumer task. See [`lazy`].
pub struct LazyTask<T> {
    core: Option<NonNull<LazyCore<T>>>,
    frame: RawHandle,
    parked: bool,
}

unsafe impl<T: Send> Send for LazyTask<T> {}

impl<T> LazyTask<T> {
    /// Extracts the result and reaps the producer frame.
    fn extract(&mut self) -> T {
        let core = self.core.take().expect("lazy task already extracted");
        unsafe {
            let value = LazyCore::take(core);
            // The frame completed; destroy only releases its allocation.
            self.frame.destroy();
            LazyCore::dealloc(core);
            value
        }
    }
}

impl<T> Future for LazyTask<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = unsafe { self.get_unchecked_mut() };
        let core = this.core.expect("lazy task polled after extraction");
        if this.parked || unsafe { LazyCore::is_done(core) } {
            return Poll::Ready(this.extract());
        }
        this.parked = true;
        unsafe { LazyCore::start(core, context::current()) };
        Poll::Pending
    }
}

impl<T> Join for LazyTask<T> {
    type Output = T;

    fn is_ready(&self) -> bool {
        match self.core {
            Some(core) => unsafe { LazyCore::is_done(core) },
            None => true,
        }
    }

    fn follower(&self) -> Follower {
        let core = self.core.expect("lazy task already extracted");
        Follower::new(core.cast(), lazy_follower_vtable::<T>())
    }

    fn take(&mut self) -> T {
        self.extract()
    }
}

fn lazy_follower_vtable<T>() -> &'static FollowerVtable {
    unsafe fn is_ready_raw<T>(core: NonNull<()>) -> bool {
        unsafe { LazyCore::is_done(core.cast::<LazyCore<T>>()) }
    }
    unsafe fn follow_raw<T>(
        core: NonNull<()>,
        node: NonNull<crate::chain::Chained>,
    ) -> FollowOutcome {
        // The lazy slot parks the bare handle; the node is only the
        // carrier the generic protocol hands us.
        unsafe { LazyCore::start(core.cast::<LazyCore<T>>(), node.as_ref().coro) };
        FollowOutcome::Parked
    }
    &FollowerVtable {
        is_ready: is_ready_raw::<T>,
        follow: follow_raw::<T>,
    }
}

impl<T> Drop for LazyTask<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            self.frame.destroy();
            unsafe { LazyCore::dealloc(core) };
        }
    }
}
