use std::future::Future;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::task::{Context, Poll};

use crate::frame::{context, RawHandle};

/// Awaits completion of a set of RAII work tickets.
///
/// [`create`](WorkGroup::create) hands out a [`Work`] ticket and counts it
/// outstanding until the ticket is dropped; [`wait`](WorkGroup::wait)
/// completes once the count reaches zero. Single waiter at a time.
pub struct WorkGroup {
    then: AtomicPtr<()>,
    count: AtomicU32,
}

unsafe impl Send for WorkGroup {}
unsafe impl Sync for WorkGroup {}

impl WorkGroup {
    pub fn new() -> WorkGroup {
        WorkGroup {
            then: AtomicPtr::new(ptr::null_mut()),
            count: AtomicU32::new(0),
        }
    }

    fn sentinel(&self) -> *mut () {
        ptr::from_ref(self).cast_mut().cast()
    }

    /// Registers one unit of work; it completes when the ticket drops.
    pub fn create(&self) -> Work<'_> {
        self.count.fetch_add(1, Ordering::Release);
        Work { group: self }
    }

    pub fn is_idle(&self) -> bool {
        self.count.load(Ordering::Relaxed) == 0
    }

    /// Completes once every ticket has been dropped; immediately if none
    /// are outstanding.
    pub fn wait(&self) -> WorkGroupWait<'_> {
        WorkGroupWait {
            group: self,
            parked: false,
        }
    }

    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::Release) == 1 {
            // Trade the slot for the sentinel; resume whoever was parked.
            let prior = self.then.swap(self.sentinel(), Ordering::Acquire);
            if !prior.is_null() && prior != self.sentinel() {
                unsafe { RawHandle(NonNull::new_unchecked(prior.cast())).resume() };
            }
        }
    }
}

impl Default for WorkGroup {
    fn default() -> WorkGroup {
        WorkGroup::new()
    }
}

impl Drop for WorkGroup {
    fn drop(&mut self) {
        debug_assert!(self.is_idle(), "work group dropped with outstanding work");
    }
}

/// Outstanding unit of work. Dropping it completes the unit.
#[must_use = "the work counts as done once the ticket is dropped"]
pub struct Work<'a> {
    group: &'a WorkGroup,
}

impl Drop for Work<'_> {
    fn drop(&mut self) {
        self.group.finish_one();
    }
}

/// Awaitable returned by [`WorkGroup::wait`].
pub struct WorkGroupWait<'a> {
    group: &'a WorkGroup,
    parked: bool,
}

impl Future for WorkGroupWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked {
            // Re-arm for the group's next cycle.
            this.group.then.store(ptr::null_mut(), Ordering::Relaxed);
            return Poll::Ready(());
        }
        if this.group.count.load(Ordering::Acquire) == 0 {
            return Poll::Ready(());
        }
        let handle = context::current();
        let prior = this
            .group
            .then
            .swap(handle.0.as_ptr().cast(), Ordering::Release);
        if !prior.is_null() {
            // The last ticket raced us and already fired; clean up and
            // complete without suspending.
            debug_assert_eq!(prior, this.group.sentinel());
            this.group.then.store(ptr::null_mut(), Ordering::Relaxed);
            return Poll::Ready(());
        }
        this.parked = true;
        Poll::Pending
    }
}
