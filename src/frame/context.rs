use std::cell::Cell;
use std::ptr::NonNull;

use crate::frame::cell::Header;
use crate::frame::RawHandle;

thread_local! {
    /// The frame whose poll loop is currently running on this thread.
    static CURRENT: Cell<Option<NonNull<Header>>> = const { Cell::new(None) };

    /// Set by an awaitable whose producer is gone: the current frame must be
    /// destroyed instead of parked. Consumed by the poll loop right after
    /// the poll that set it returns `Pending`.
    static CANCEL: Cell<bool> = const { Cell::new(false) };
}

/// Handle of the frame currently being polled.
///
/// Panics when called outside a frame: the crate's awaitables can only
/// suspend code that is driven by `spawn`/`lazy` frames or the blocking
/// bridge.
pub(crate) fn current() -> RawHandle {
    let ptr = CURRENT
        .with(Cell::get)
        .expect("strand awaitable polled outside a frame; drive it with spawn, lazy or wait/get");
    RawHandle(ptr)
}

pub(crate) fn request_cancel() {
    CANCEL.with(|c| c.set(true));
}

pub(crate) fn take_cancel_request() -> bool {
    CANCEL.with(|c| c.replace(false))
}

/// Scope guard installing `frame` as the current one. Poll loops nest (a
/// drain can run inside another frame's poll), so the previous value is
/// restored on drop.
pub(crate) struct Enter {
    prev: Option<NonNull<Header>>,
}

pub(crate) fn enter(frame: NonNull<Header>) -> Enter {
    Enter {
        prev: CURRENT.with(|c| c.replace(Some(frame))),
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}
