//! Structured concurrency on eagerly-started frames.
//!
//! [`spawn`] starts a future in its own heap frame and hands back a
//! [`Task`]: awaiting it yields the result, dropping it cancels the
//! producer and everything the producer was awaiting. Chains of awaits of
//! any depth resume iteratively through a thread-local scheduler, so deep
//! pipelines never overflow the stack.
//!
//! Around the task core: [`SharedTask`] (multi-owner), [`LazyTask`]
//! (starts on first await), [`Event`], [`Mutex`], [`Channel`],
//! [`WorkGroup`], the [`when_all`]/[`when_any`] combinators, and a
//! blocking bridge ([`wait`], [`wait_for`], [`get`]) to drive awaitables
//! from synchronous code.
//!
//! There is no built-in thread pool: frames resume on whichever thread
//! wakes them, and primitives that wake asynchronously accept an
//! [`Executor`] for handing wakeups to one of your own.

pub mod blocking;
pub use blocking::{get, wait, wait_for, wait_until, Canceled};

mod chain;

pub mod executor;
pub use executor::{default_executor, Continuation, Executor};

mod frame;
pub use frame::{suspend, FrameHandle, Suspend};

mod join;
pub use join::{when_ready, Follower, Join, WhenReady};

pub mod sync;
pub use sync::{
    when_all, when_any, Channel, Event, JoinTuple, Mutex, MutexGuard, WhenAny, Work, WorkGroup,
};

pub mod task;
pub use task::{lazy, spawn, spawn_detached, spawn_shared, LazyTask, SharedTask, Task};
