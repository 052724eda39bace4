use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crate::chain::{self, Chained};
use crate::executor::{default_executor, Continuation, Executor};
use crate::frame::context;

/// One-shot, resettable broadcast.
///
/// `then` encodes the whole state: null = unset, the event's own address =
/// set, anything else = head of a LIFO list of parked waiters. Waiters are
/// woken in LIFO order and must not depend on arrival order.
pub struct Event {
    then: AtomicPtr<()>,
    exe: &'static dyn Executor,
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    pub fn new() -> Event {
        Event::with_executor(default_executor())
    }

    /// An event whose wakeups are dispatched through `exe`.
    pub fn with_executor(exe: &'static dyn Executor) -> Event {
        Event {
            then: AtomicPtr::new(ptr::null_mut()),
            exe,
        }
    }

    fn sentinel(&self) -> *mut () {
        ptr::from_ref(self).cast_mut().cast()
    }

    pub fn is_set(&self) -> bool {
        self.then.load(Ordering::Acquire) == self.sentinel()
    }

    /// Completes when the event is set; immediately if it already is.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait {
            event: self,
            node: Chained::idle(),
            parked: false,
            _pin: PhantomPinned,
        }
    }

    /// Sets the event, waking every parked waiter through the executor.
    /// Idempotent until [`reset`](Event::reset).
    pub fn set(&self) {
        let mut next = self.then.swap(self.sentinel(), Ordering::AcqRel);
        if next == self.sentinel() {
            return;
        }
        tracing::trace!("event set");
        while !next.is_null() {
            let node = next.cast::<Chained>();
            // The continuation may run and invalidate the node; step first.
            next = unsafe { (*node).next };
            self.exe
                .execute(Continuation::new(unsafe { NonNull::new_unchecked(node) }));
        }
    }

    /// Re-arms a set event. A reset racing a concurrent `set` has no
    /// effect once that set began waking waiters.
    pub fn reset(&self) {
        let _ = self.then.compare_exchange(
            self.sentinel(),
            ptr::null_mut(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Waiters still queued never get their set(); cancel them.
        let mut next = self.then.swap(ptr::null_mut(), Ordering::Acquire);
        let sentinel = self.sentinel();
        while !next.is_null() && next != sentinel {
            let node = next.cast::<Chained>();
            next = unsafe { (*node).next };
            unsafe { chain::schedule_destroy(NonNull::new_unchecked(node)) };
        }
    }
}

/// Awaitable returned by [`Event::wait`].
pub struct EventWait<'a> {
    event: &'a Event,
    node: Chained,
    parked: bool,
    _pin: PhantomPinned,
}

// Safety: the intrusive node is only shared while parked; the handoff is
// synchronized by the event's atomic slot.
unsafe impl Send for EventWait<'_> {}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // Safety: the node address is pin-stable.
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked {
            return Poll::Ready(());
        }
        let sentinel = this.event.sentinel();
        this.node.coro = context::current();
        let mut prev = this.event.then.load(Ordering::Relaxed);
        loop {
            if prev == sentinel {
                return Poll::Ready(());
            }
            this.node.next = prev;
            match this.event.then.compare_exchange_weak(
                prev,
                ptr::from_mut(&mut this.node).cast(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    this.parked = true;
                    return Poll::Pending;
                }
                Err(actual) => prev = actual,
            }
        }
    }
}
