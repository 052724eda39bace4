//! The coroutine primitive: heap-allocated frames driving pinned futures.
//!
//! A frame is resumed by polling and suspended by parking its handle on a
//! primitive before returning `Pending`. Destroying a frame drops the
//! future, running the destructors of its locals; that is the entire
//! cancellation mechanism, and it propagates because those locals own the
//! handles of everything the frame was waiting on.

mod cell;
pub(crate) mod context;
mod state;

pub(crate) use self::cell::{allocate, Complete, RawFrame, RawHandle};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Owner of a suspended frame, as handed out by [`suspend`].
///
/// Exactly one of [`resume`](FrameHandle::resume) or
/// [`destroy`](FrameHandle::destroy) must eventually be called; dropping
/// the handle leaks the frame.
pub struct FrameHandle {
    raw: RawHandle,
}

unsafe impl Send for FrameHandle {}

impl FrameHandle {
    pub(crate) fn from_raw(raw: RawHandle) -> FrameHandle {
        FrameHandle { raw }
    }

    /// Runs the frame until its next suspension or completion.
    pub fn resume(self) {
        self.raw.resume();
    }

    /// Tears the frame down without resuming it. Destructors of the
    /// frame's locals run; tasks it was awaiting are cancelled.
    pub fn destroy(self) {
        self.raw.destroy();
    }
}

/// Suspends the current frame and hands its [`FrameHandle`] to `f`.
///
/// `f` runs at the first poll, while the frame is already prepared to be
/// resumed from any thread. The await completes when the handle is resumed.
pub fn suspend<F>(f: F) -> Suspend<F>
where
    F: FnOnce(FrameHandle),
{
    Suspend { f: Some(f) }
}

/// Awaitable returned by [`suspend`].
pub struct Suspend<F> {
    f: Option<F>,
}

impl<F> Future for Suspend<F>
where
    F: FnOnce(FrameHandle),
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // No intrusive state: `Suspend` stays movable until first poll and
        // the callback owns the handoff entirely.
        let this = unsafe { self.get_unchecked_mut() };
        match this.f.take() {
            Some(f) => {
                f(FrameHandle::from_raw(context::current()));
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}
