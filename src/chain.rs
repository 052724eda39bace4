use std::cell::Cell;
use std::ptr::{self, NonNull};

use crate::frame::RawHandle;

/// What the drain does with a queued frame when it reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Resume,
    Destroy,
}

/// Intrusive node linking a suspended frame into a waiter list.
///
/// The node lives inside the awaiter future that parked the frame, so its
/// address is stable for as long as the frame stays suspended. Whoever
/// removes the node from a primitive's atomic slot owns the frame until it
/// is resumed or destroyed. `next` is typed as `*mut ()` because each list
/// uses its own terminator (null, or the owning primitive's address); the
/// scheduler below only ever links nodes with node pointers and null.
pub(crate) struct Chained {
    pub(crate) coro: RawHandle,
    pub(crate) next: *mut (),
    pub(crate) op: Op,
}

impl Chained {
    pub(crate) fn idle() -> Chained {
        Chained {
            coro: RawHandle::dangling(),
            next: ptr::null_mut(),
            op: Op::Resume,
        }
    }
}

thread_local! {
    /// Non-null while a drain is running on this thread. Points at the
    /// drain's local list head so nested `schedule` calls can prepend
    /// instead of recursing.
    static CHAIN: Cell<*mut *mut Chained> = const { Cell::new(ptr::null_mut()) };
}

/// Queue `node` for resumption.
///
/// # Safety
///
/// The caller transfers ownership of the frame behind `node.coro`; the node
/// must stay valid until the drain consumes it.
pub(crate) unsafe fn schedule_resume(node: NonNull<Chained>) {
    unsafe { schedule(node, Op::Resume) };
}

/// Queue `node` for destruction. Same contract as [`schedule_resume`].
pub(crate) unsafe fn schedule_destroy(node: NonNull<Chained>) {
    unsafe { schedule(node, Op::Destroy) };
}

/// Iteratively runs pending resumes/destroys on the current thread.
///
/// The first call on a thread becomes the drainer: it executes its own node,
/// then keeps popping whatever nested finalizations enqueued, all from this
/// one stack frame. Re-entrant calls (a resumed frame finalizing another
/// task) prepend to the in-flight list and return, which bounds the stack
/// depth of arbitrarily long resume chains. Drain order is LIFO.
unsafe fn schedule(node: NonNull<Chained>, op: Op) {
    CHAIN.with(|chain| {
        let slot = chain.get();
        if !slot.is_null() {
            // A drain is already running below us; hand the node to it.
            unsafe {
                (*node.as_ptr()).op = op;
                (*node.as_ptr()).next = (*slot).cast();
                *slot = node.as_ptr();
            }
            return;
        }

        let mut pending: *mut Chained = ptr::null_mut();
        chain.set(&mut pending);

        // Read everything out of a node before running it: resuming or
        // destroying the frame invalidates the node, which lives inside it.
        let mut coro = unsafe { node.as_ref() }.coro;
        let mut op = op;
        loop {
            match op {
                Op::Resume => coro.resume(),
                Op::Destroy => coro.destroy(),
            }
            let head = pending;
            if head.is_null() {
                break;
            }
            unsafe {
                pending = (*head).next.cast();
                coro = (*head).coro;
                op = (*head).op;
            }
        }

        chain.set(ptr::null_mut());
    });
}
