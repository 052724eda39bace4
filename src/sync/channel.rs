#![allow(unsafe_op_in_unsafe_fn)]

use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::marker::PhantomPinned;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crate::chain::Chained;
use crate::executor::{default_executor, Continuation, Executor};
use crate::frame::context;
use crate::sync::spin::Spinlock;

/// Channel between one sender and one receiver.
///
/// The default channel is an unbuffered rendezvous: a push completes when a
/// pop takes the value, and vice versa. [`Channel::buffered`] adds a
/// bounded ring; pushes then only suspend when the ring is full and pops
/// when it is empty.
///
/// A single atomic `side` carries the rendezvous state: null = nobody
/// parked, the channel's own address = closed, anything else = the one
/// parked awaiter (a pusher carrying a value, or a popper waiting for
/// one). At most one frame per direction may be parked; two concurrent
/// pushes (or pops) are undefined and debug-asserted.
///
/// After [`close`](Channel::close), pushes fail immediately; pops still
/// drain values that were buffered before the close, then report empty.
pub struct Channel<T> {
    side: AtomicPtr<()>,
    ring: Option<Ring<T>>,
    exe: &'static dyn Executor,
}

unsafe impl<T: Send> Send for Channel<T> {}
unsafe impl<T: Send> Sync for Channel<T> {}

impl<T> Channel<T> {
    /// Unbuffered rendezvous channel.
    pub fn new() -> Channel<T> {
        Channel {
            side: AtomicPtr::new(ptr::null_mut()),
            ring: None,
            exe: default_executor(),
        }
    }

    /// Channel with a bounded ring of `capacity` slots (0 behaves like a
    /// rendezvous with the buffered code path).
    pub fn buffered(capacity: usize) -> Channel<T> {
        Channel::buffered_with_executor(capacity, default_executor())
    }

    pub fn buffered_with_executor(
        capacity: usize,
        exe: &'static dyn Executor,
    ) -> Channel<T> {
        Channel {
            side: AtomicPtr::new(ptr::null_mut()),
            ring: Some(Ring::new(capacity)),
            exe,
        }
    }

    fn sentinel(&self) -> *mut () {
        ptr::from_ref(self).cast_mut().cast()
    }

    /// Delivers `value`; completes with true once a receiver took it (or
    /// it was buffered), false if the channel closed first.
    pub fn push(&self, value: T) -> Push<'_, T> {
        Push {
            ch: self,
            waiter: Parked::new(Direction::Push, Some(value)),
            parked: false,
            _pin: PhantomPinned,
        }
    }

    /// Receives the next value; completes with `None` once the channel is
    /// closed and drained.
    pub fn pop(&self) -> Pop<'_, T> {
        Pop {
            ch: self,
            waiter: Parked::new(Direction::Pop, None),
            parked: false,
            _pin: PhantomPinned,
        }
    }

    /// Closes both directions and wakes a parked awaiter, which then
    /// observes the close (a popper sees empty, a pusher keeps its value
    /// and reports failure).
    pub fn close(&self) {
        let prior = self.side.swap(self.sentinel(), Ordering::AcqRel);
        if prior.is_null() || prior == self.sentinel() {
            return;
        }
        tracing::debug!("channel closed with a parked awaiter");
        let peer = prior.cast::<Parked<T>>();
        self.exe
            .execute(Continuation::new(unsafe {
                NonNull::new_unchecked(ptr::addr_of_mut!((*peer).chained))
            }));
    }

    /// Takes over a parked pusher, if any. On success the ring lock has
    /// been released.
    fn try_notify_push(&self, ring: &Ring<T>) -> Option<NonNull<Parked<T>>> {
        let side = self.side.load(Ordering::Relaxed);
        if !side.is_null()
            && side != self.sentinel()
            && self
                .side
                .compare_exchange(side, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            ring.lock.unlock();
            let peer = unsafe { NonNull::new_unchecked(side.cast::<Parked<T>>()) };
            debug_assert_eq!(
                unsafe { peer.as_ref() }.dir,
                Direction::Push,
                "two frames popping the same channel"
            );
            return Some(peer);
        }
        None
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Channel<T> {
        Channel::new()
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        // Values still buffered are discarded.
        if let Some(ring) = &self.ring {
            unsafe { ring.drain() };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pop,
}

/// The parked awaiter published in `side`. Laid out with the chain node
/// first so the scheduler's node pointer and the awaiter coincide.
#[repr(C)]
struct Parked<T> {
    chained: Chained,
    data: UnsafeCell<Option<T>>,
    dir: Direction,
}

impl<T> Parked<T> {
    fn new(dir: Direction, data: Option<T>) -> Parked<T> {
        Parked {
            chained: Chained::idle(),
            data: UnsafeCell::new(data),
            dir,
        }
    }
}

/// Bounded ring, guarded by a spinlock. Invariant: whenever an awaiter is
/// parked in `side`, the ring is empty (a popper) or full (a pusher).
struct Ring<T> {
    lock: Spinlock,
    used: Cell<usize>,
    head: Cell<usize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Ring<T> {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Ring {
            lock: Spinlock::new(),
            used: Cell::new(0),
            head: Cell::new(0),
            slots,
        }
    }

    /// Slot index for an insert, unless full (or zero-capacity).
    fn try_push(&self) -> Option<usize> {
        if self.used.get() == self.slots.len() {
            return None;
        }
        Some((self.head.get() + self.used.get()) % self.slots.len())
    }

    /// Pops the head index, advancing `head` but leaving `used` to the
    /// caller: the slot may be refilled in place by a parked pusher.
    fn try_pop(&self) -> Option<usize> {
        if self.used.get() == 0 {
            return None;
        }
        let idx = self.head.get();
        self.head.set((idx + 1) % self.slots.len());
        Some(idx)
    }

    unsafe fn write(&self, idx: usize, value: T) {
        (*self.slots[idx].get()).write(value);
    }

    unsafe fn read(&self, idx: usize) -> T {
        (*self.slots[idx].get()).assume_init_read()
    }

    unsafe fn replace(&self, idx: usize, value: T) -> T {
        let out = self.read(idx);
        self.write(idx, value);
        out
    }

    unsafe fn drain(&self) {
        while self.used.get() > 0 {
            let idx = self.head.get();
            drop(self.read(idx));
            self.head.set((idx + 1) % self.slots.len());
            self.used.set(self.used.get() - 1);
        }
    }
}

/// Awaitable returned by [`Channel::push`].
#[must_use = "a push does nothing until awaited"]
pub struct Push<'a, T> {
    ch: &'a Channel<T>,
    waiter: Parked<T>,
    parked: bool,
    _pin: PhantomPinned,
}

// Safety: the parked node is only shared through `side`; data transfer is
// synchronized by the CAS that removes it.
unsafe impl<T: Send> Send for Push<'_, T> {}

impl<T> Future for Push<'_, T> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        // Safety: the waiter address is pin-stable.
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked {
            // Delivered iff the peer (or the buffer handoff) took the value.
            return Poll::Ready(unsafe { &mut *this.waiter.data.get() }.take().is_none());
        }
        if this.ch.ring.is_some() {
            this.poll_buffered()
        } else {
            this.poll_rendezvous()
        }
    }
}

impl<T> Push<'_, T> {
    fn poll_rendezvous(&mut self) -> Poll<bool> {
        let ch = self.ch;
        self.waiter.chained.coro = context::current();
        let waiter = ptr::from_mut(&mut self.waiter).cast::<()>();
        match ch
            .side
            .compare_exchange(ptr::null_mut(), waiter, Ordering::Release, Ordering::Acquire)
        {
            Ok(_) => {
                self.parked = true;
                Poll::Pending
            }
            Err(prior) if prior == ch.sentinel() => Poll::Ready(false),
            Err(prior) => {
                let peer = prior.cast::<Parked<T>>();
                debug_assert_eq!(
                    unsafe { (*peer).dir },
                    Direction::Pop,
                    "two frames pushing the same channel"
                );
                match ch.side.compare_exchange(
                    prior,
                    ptr::null_mut(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => unsafe {
                        // Hand the value straight to the popper.
                        *(*peer).data.get() = (*self.waiter.data.get()).take();
                        crate::chain::schedule_resume(NonNull::new_unchecked(
                            ptr::addr_of_mut!((*peer).chained),
                        ));
                        Poll::Ready(true)
                    },
                    // The close beat us to the parked peer.
                    Err(_) => Poll::Ready(false),
                }
            }
        }
    }

    fn poll_buffered(&mut self) -> Poll<bool> {
        let ch = self.ch;
        let ring = ch.ring.as_ref().unwrap();
        ring.lock.lock();
        let side = ch.side.load(Ordering::Relaxed);
        if !side.is_null() {
            if side == ch.sentinel()
                || ch
                    .side
                    .compare_exchange(side, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                ring.lock.unlock();
                return Poll::Ready(false);
            }
            ring.lock.unlock();
            let peer = side.cast::<Parked<T>>();
            debug_assert_eq!(
                unsafe { (*peer).dir },
                Direction::Pop,
                "two frames pushing the same channel"
            );
            unsafe {
                *(*peer).data.get() = (*self.waiter.data.get()).take();
                ch.exe.execute(Continuation::new(NonNull::new_unchecked(
                    ptr::addr_of_mut!((*peer).chained),
                )));
            }
            return Poll::Ready(true);
        }
        if let Some(idx) = ring.try_push() {
            unsafe {
                let value = (*self.waiter.data.get()).take().unwrap();
                ring.write(idx, value);
            }
            ring.used.set(ring.used.get() + 1);
            ring.lock.unlock();
            return Poll::Ready(true);
        }
        // Full: park while still holding the ring lock, so a concurrent
        // pop cannot miss us.
        self.waiter.chained.coro = context::current();
        let waiter = ptr::from_mut(&mut self.waiter).cast::<()>();
        let installed = ch
            .side
            .compare_exchange(ptr::null_mut(), waiter, Ordering::Release, Ordering::Acquire)
            .is_ok();
        ring.lock.unlock();
        if installed {
            self.parked = true;
            Poll::Pending
        } else {
            // Lost to a close.
            Poll::Ready(false)
        }
    }
}

/// Awaitable returned by [`Channel::pop`].
#[must_use = "a pop does nothing until awaited"]
pub struct Pop<'a, T> {
    ch: &'a Channel<T>,
    waiter: Parked<T>,
    parked: bool,
    _pin: PhantomPinned,
}

// Safety: as for `Push`.
unsafe impl<T: Send> Send for Pop<'_, T> {}

impl<T> Future for Pop<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<T>> {
        // Safety: the waiter address is pin-stable.
        let this = unsafe { self.get_unchecked_mut() };
        if this.parked {
            return Poll::Ready(unsafe { &mut *this.waiter.data.get() }.take());
        }
        if this.ch.ring.is_some() {
            this.poll_buffered()
        } else {
            this.poll_rendezvous()
        }
    }
}

impl<T> Pop<'_, T> {
    fn poll_rendezvous(&mut self) -> Poll<Option<T>> {
        let ch = self.ch;
        self.waiter.chained.coro = context::current();
        let waiter = ptr::from_mut(&mut self.waiter).cast::<()>();
        match ch
            .side
            .compare_exchange(ptr::null_mut(), waiter, Ordering::Release, Ordering::Acquire)
        {
            Ok(_) => {
                self.parked = true;
                Poll::Pending
            }
            Err(prior) if prior == ch.sentinel() => Poll::Ready(None),
            Err(prior) => {
                let peer = prior.cast::<Parked<T>>();
                debug_assert_eq!(
                    unsafe { (*peer).dir },
                    Direction::Push,
                    "two frames popping the same channel"
                );
                match ch.side.compare_exchange(
                    prior,
                    ptr::null_mut(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => unsafe {
                        // Take the pusher's value; the emptied slot tells
                        // it the push succeeded.
                        let value = (*(*peer).data.get()).take();
                        crate::chain::schedule_resume(NonNull::new_unchecked(
                            ptr::addr_of_mut!((*peer).chained),
                        ));
                        Poll::Ready(value)
                    },
                    Err(_) => Poll::Ready(None),
                }
            }
        }
    }

    fn poll_buffered(&mut self) -> Poll<Option<T>> {
        let ch = self.ch;
        let ring = ch.ring.as_ref().unwrap();
        ring.lock.lock();
        if let Some(idx) = ring.try_pop() {
            if let Some(peer) = ch.try_notify_push(ring) {
                // Ring stays full: the freed slot becomes the tail and
                // takes the parked pusher's value, preserving FIFO.
                unsafe {
                    let pushed = (*peer.as_ref().data.get()).take().unwrap();
                    let value = ring.replace(idx, pushed);
                    ch.exe.execute(Continuation::new(NonNull::new_unchecked(
                        ptr::addr_of_mut!((*peer.as_ptr()).chained),
                    )));
                    return Poll::Ready(Some(value));
                }
            }
            ring.used.set(ring.used.get() - 1);
            let value = unsafe { ring.read(idx) };
            ring.lock.unlock();
            return Poll::Ready(Some(value));
        }
        if let Some(peer) = ch.try_notify_push(ring) {
            // Zero-capacity ring: rendezvous directly.
            unsafe {
                let value = (*peer.as_ref().data.get()).take();
                ch.exe.execute(Continuation::new(NonNull::new_unchecked(
                    ptr::addr_of_mut!((*peer.as_ptr()).chained),
                )));
                return Poll::Ready(value);
            }
        }
        self.waiter.chained.coro = context::current();
        let waiter = ptr::from_mut(&mut self.waiter).cast::<()>();
        let installed = ch
            .side
            .compare_exchange(ptr::null_mut(), waiter, Ordering::Release, Ordering::Acquire)
            .is_ok();
        ring.lock.unlock();
        if installed {
            self.parked = true;
            Poll::Pending
        } else {
            Poll::Ready(None)
        }
    }
}
