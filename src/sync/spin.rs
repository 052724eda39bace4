use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

/// Spinlock guarding the buffered channel's ring. Critical sections are a
/// few loads and stores, never user code.
pub(crate) struct Spinlock {
    flag: AtomicBool,
}

impl Spinlock {
    pub(crate) fn new() -> Spinlock {
        Spinlock {
            flag: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) {
        while self.flag.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }
    }

    pub(crate) fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}
