use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crate::chain::{self, Chained};
use crate::frame::context;

/// Coroutine mutex.
///
/// A Treiber-stack queue whose head also encodes the lock state: null =
/// unlocked, the mutex's own address = locked with no waiters, anything
/// else = head of the waiter stack (whose terminal link is the mutex
/// address). Waiters are woken in LIFO order; the contract is mutual
/// exclusion and eventual progress, not fairness.
pub struct Mutex {
    then: AtomicPtr<()>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            then: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn sentinel(&self) -> *mut () {
        ptr::from_ref(self).cast_mut().cast()
    }

    /// Acquires without suspending, or reports the lock busy.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.then
            .compare_exchange(
                ptr::null_mut(),
                self.sentinel(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| MutexGuard { lock: self })
    }

    /// Completes once the lock is held, yielding the guard that releases
    /// it on drop.
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            lock: self,
            node: Chained::idle(),
            parked: false,
            _pin: PhantomPinned,
        }
    }

    fn unlock(&self) {
        let mut curr = self.sentinel();
        if self
            .then
            .compare_exchange(curr, ptr::null_mut(), Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        // Pop the top waiter; resuming it passes lock ownership along.
        loop {
            curr = self.then.load(Ordering::Acquire);
            let next = unsafe { (*curr.cast::<Chained>()).next };
            match self
                .then
                .compare_exchange_weak(curr, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
        unsafe { chain::schedule_resume(NonNull::new_unchecked(curr.cast())) };
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        debug_assert!(
            self.then.load(Ordering::Relaxed).is_null(),
            "mutex dropped while locked"
        );
    }
}

/// Scoped ownership of a [`Mutex`]; unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    lock: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Awaitable returned by [`Mutex::lock`].
pub struct Lock<'a> {
    lock: &'a Mutex,
    node: Chained,
    parked: bool,
    _pin: PhantomPinned,
}

// Safety: the intrusive node is only shared while parked; the handoff is
// synchronized by the mutex's atomic head.
unsafe impl Send for Lock<'_> {}

impl<'a> Future for Lock<'a> {
    type Output = MutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<MutexGuard<'a>> {
        // Safety: the node address is pin-stable.
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked {
            // Resumed by unlock: the lock is already ours.
            return Poll::Ready(MutexGuard { lock: this.lock });
        }
        this.node.coro = context::current();
        let mut expected: *mut () = ptr::null_mut();
        loop {
            if expected.is_null() {
                match this.lock.then.compare_exchange(
                    expected,
                    this.lock.sentinel(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Poll::Ready(MutexGuard { lock: this.lock }),
                    Err(actual) => expected = actual,
                }
                continue;
            }
            // Locked: push ourselves on the waiter stack.
            this.node.next = expected;
            match this.lock.then.compare_exchange_weak(
                expected,
                ptr::from_mut(&mut this.node).cast(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    this.parked = true;
                    return Poll::Pending;
                }
                Err(actual) => expected = actual,
            }
        }
    }
}
