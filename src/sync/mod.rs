//! Synchronization primitives and combinators.

pub mod channel;
pub mod event;
pub mod mutex;
pub(crate) mod spin;
pub mod when_all;
pub mod when_any;
pub mod work_group;

pub use self::channel::Channel;
pub use self::event::Event;
pub use self::mutex::{Mutex, MutexGuard};
pub use self::when_all::{when_all, JoinTuple};
pub use self::when_any::{when_any, WhenAny};
pub use self::work_group::{Work, WorkGroup};

#[cfg(test)]
mod tests;
