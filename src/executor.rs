//! The scheduling seam used by primitives that wake frames asynchronously.

use std::ptr::NonNull;

use crate::chain::{self, Chained};

/// A detached waiter, removed from a primitive's slot and ready to run.
///
/// Resuming goes through the chained-continuation scheduler, so executing
/// inline from a deep resume chain cannot overflow the stack.
pub struct Continuation {
    node: NonNull<Chained>,
}

// Safety: the continuation owns the parked frame; the node stays valid
// until resumed.
unsafe impl Send for Continuation {}

impl Continuation {
    pub(crate) fn new(node: NonNull<Chained>) -> Continuation {
        Continuation { node }
    }

    /// Resumes the parked frame.
    pub fn resume(self) {
        unsafe { chain::schedule_resume(self.node) };
    }
}

/// Dispatches wakeups triggered outside a frame's own resume path (event
/// set, channel rendezvous). The default resumes inline; an integration
/// with a thread pool hands the continuation to its queue instead.
pub trait Executor: Send + Sync {
    fn execute(&self, cont: Continuation);
}

struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, cont: Continuation) {
        cont.resume();
    }
}

/// The inline executor primitives default to.
pub fn default_executor() -> &'static dyn Executor {
    static INLINE: InlineExecutor = InlineExecutor;
    &INLINE
}
