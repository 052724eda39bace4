#![allow(unsafe_op_in_unsafe_fn)]

use std::any::Any;
use std::cell::UnsafeCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

use crate::frame::context;
use crate::frame::state::{
    Lifecycle, TransitionToDestroy, TransitionToIdle, TransitionToRunning,
};

/// Erased entry points into a concrete `FrameCell<F, C>`.
pub(crate) struct Vtable {
    resume: unsafe fn(NonNull<Header>),
    destroy: unsafe fn(NonNull<Header>),
    dealloc: unsafe fn(NonNull<Header>),
}

/// Hot head of every frame allocation. All erased handles are pointers to
/// this; the concrete cell is recovered by casting, so `Header` must stay
/// the first field of `FrameCell`.
#[repr(C)]
pub(crate) struct Header {
    state: Lifecycle,
    vtable: &'static Vtable,
}

/// A frame: lifecycle word, the pinned future driving it, and the
/// completion that decides what happens to the result.
#[repr(C)]
struct FrameCell<F: Future, C: Complete<F::Output>> {
    header: Header,
    stage: UnsafeCell<Stage<F>>,
    completion: UnsafeCell<Option<C>>,
}

enum Stage<F> {
    Live(F),
    Done,
}

/// Where a frame's outcome goes. Every path consumes `frame` exactly once;
/// implementations decide whether that releases the allocation (tasks) or
/// leaves it for an owner to reap (lazy frames).
pub(crate) trait Complete<T> {
    /// The future returned `Ready(value)`. Locals are already dropped.
    unsafe fn complete(self, frame: RawFrame, value: T);

    /// The future panicked while polling; locals were dropped by the unwind.
    unsafe fn panicked(self, frame: RawFrame, payload: Box<dyn Any + Send>);

    /// The frame is destroyed before completing. Locals are already
    /// dropped, which is what propagates cancellation downward.
    unsafe fn cancel(self, frame: RawFrame);
}

/// Token handed to a [`Complete`] impl, able to release the allocation.
pub(crate) struct RawFrame(NonNull<Header>);

impl RawFrame {
    pub(crate) unsafe fn dealloc(self) {
        let vtable = self.0.as_ref().vtable;
        (vtable.dealloc)(self.0);
    }

    /// Keep the allocation alive; its owner deallocates through
    /// [`RawHandle::destroy`] later.
    pub(crate) fn keep(self) {}
}

/// Copyable erased frame pointer. Resuming or destroying requires owning
/// the frame (holding the only live copy); the lifecycle word only covers
/// the owner racing a poll loop that has not unwound yet.
#[derive(Clone, Copy)]
pub(crate) struct RawHandle(pub(crate) NonNull<Header>);

unsafe impl Send for RawHandle {}

impl RawHandle {
    pub(crate) fn dangling() -> RawHandle {
        RawHandle(NonNull::dangling())
    }

    pub(crate) fn resume(self) {
        unsafe {
            let vtable = self.0.as_ref().vtable;
            (vtable.resume)(self.0);
        }
    }

    pub(crate) fn destroy(self) {
        unsafe {
            let vtable = self.0.as_ref().vtable;
            (vtable.destroy)(self.0);
        }
    }
}

/// Allocates a frame around `future`. The frame does not run until the
/// first [`RawHandle::resume`].
pub(crate) fn allocate<F, C>(future: F, completion: C) -> RawHandle
where
    F: Future,
    C: Complete<F::Output>,
{
    let cell = Box::new(FrameCell {
        header: Header {
            state: Lifecycle::new(),
            vtable: vtable::<F, C>(),
        },
        stage: UnsafeCell::new(Stage::Live(future)),
        completion: UnsafeCell::new(Some(completion)),
    });
    RawHandle(NonNull::from(Box::leak(cell)).cast())
}

fn vtable<F, C>() -> &'static Vtable
where
    F: Future,
    C: Complete<F::Output>,
{
    &Vtable {
        resume: resume_raw::<F, C>,
        destroy: destroy_raw::<F, C>,
        dealloc: dealloc_raw::<F, C>,
    }
}

unsafe fn resume_raw<F, C>(ptr: NonNull<Header>)
where
    F: Future,
    C: Complete<F::Output>,
{
    match ptr.as_ref().state.transition_to_running() {
        // A poll loop is unwinding somewhere below or on another thread;
        // it re-polls on our behalf.
        TransitionToRunning::Notified => (),
        TransitionToRunning::Ok => poll_loop::<F, C>(ptr),
    }
}

unsafe fn poll_loop<F, C>(ptr: NonNull<Header>)
where
    F: Future,
    C: Complete<F::Output>,
{
    let cell = ptr.cast::<FrameCell<F, C>>().as_ptr();
    loop {
        let polled = {
            let _enter = context::enter(ptr);
            panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                // Safety: `Running` grants exclusive access to the stage,
                // and the future never moves out of the heap cell.
                let stage = &mut *(*cell).stage.get();
                match stage {
                    Stage::Live(future) => Pin::new_unchecked(future)
                        .poll(&mut Context::from_waker(noop_waker_ref())),
                    Stage::Done => unreachable!("frame polled after completion"),
                }
            }))
        };

        match polled {
            Ok(Poll::Ready(value)) => {
                // Locals die before the result is published, matching
                // frame teardown order on the cancellation path.
                let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                    *(*cell).stage.get() = Stage::Done;
                }));
                ptr.as_ref().state.transition_to_complete();
                let completion = take_completion::<F, C>(cell);
                completion.complete(RawFrame(ptr), value);
                return;
            }
            Ok(Poll::Pending) => {
                if context::take_cancel_request() {
                    drop_frame::<F, C>(ptr);
                    return;
                }
                match ptr.as_ref().state.transition_to_idle() {
                    TransitionToIdle::Ok => return,
                    TransitionToIdle::Repoll => continue,
                    TransitionToIdle::Cancelled => {
                        drop_frame::<F, C>(ptr);
                        return;
                    }
                }
            }
            Err(payload) => {
                // The unwind already tore down the future's locals; drop
                // whatever husk remains under a guard like any other
                // cancellation drop.
                let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                    *(*cell).stage.get() = Stage::Done;
                }));
                ptr.as_ref().state.transition_to_complete();
                let completion = take_completion::<F, C>(cell);
                completion.panicked(RawFrame(ptr), payload);
                return;
            }
        }
    }
}

unsafe fn destroy_raw<F, C>(ptr: NonNull<Header>)
where
    F: Future,
    C: Complete<F::Output>,
{
    match ptr.as_ref().state.transition_to_destroy() {
        TransitionToDestroy::Drop => drop_frame::<F, C>(ptr),
        // The in-flight poll loop observes `Cancelled` and drops the frame.
        TransitionToDestroy::Deferred => (),
        TransitionToDestroy::Dealloc => dealloc_raw::<F, C>(ptr),
    }
}

/// Tears down a live frame: future first (cancelling everything it owned),
/// then the completion's cancel path.
unsafe fn drop_frame<F, C>(ptr: NonNull<Header>)
where
    F: Future,
    C: Complete<F::Output>,
{
    let cell = ptr.cast::<FrameCell<F, C>>().as_ptr();
    let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        *(*cell).stage.get() = Stage::Done;
    }));
    let completion = take_completion::<F, C>(cell);
    completion.cancel(RawFrame(ptr));
}

unsafe fn take_completion<F, C>(cell: *mut FrameCell<F, C>) -> C
where
    F: Future,
    C: Complete<F::Output>,
{
    (*(*cell).completion.get())
        .take()
        .expect("frame completion already consumed")
}

unsafe fn dealloc_raw<F, C>(ptr: NonNull<Header>)
where
    F: Future,
    C: Complete<F::Output>,
{
    // Safety: the stage is `Done` on every path that reaches here, so this
    // only releases memory.
    drop(Box::from_raw(ptr.cast::<FrameCell<F, C>>().as_ptr()));
}
