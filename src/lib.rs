//! Asynchronous job-sequencing executors.
//!
//! Primitives for funneling bursts of producer-triggered requests (UI
//! events, background decode completions) into controlled, non-overlapping
//! execution timelines:
//!
//! - [`JobOperation`]: one deferred, cancellable, awaitable unit of work.
//! - [`SequentialJobEngine`] / [`ProgressJobEngine`]: unbounded FIFO drained
//!   by exactly one consumer, with busy/pending observability and an idle
//!   barrier.
//! - [`ExclusiveAction`]: a single-slot "run now or supersede the pending
//!   one" executor.
//! - [`KeyedQueue`] / [`KeyedAction`]: per-key coalescing over one shared
//!   FIFO with at most one execution in flight.
//! - [`LatestGuard`]: an optimistic "am I still the most recent update"
//!   token.
//! - [`JobClient`] / [`JobSource`]: the request boundary binding units of
//!   work to cancellation scopes and dedup identities, delegating actual
//!   scheduling to an external [`JobHub`].
//!
//! Cancellation is cooperative and per-job throughout; a failing job is
//! logged, reaches its terminal state, unblocks its own waiters, and never
//! stops the executor that ran it.

pub mod client;
pub mod engine;
pub mod exclusive;
pub mod hub;
pub mod job;
pub mod keyed;
pub mod keyed_queue;
pub mod latest;

pub use client::{JobClient, JobSource};
pub use engine::{ProgressJobEngine, SequentialJobEngine};
pub use exclusive::ExclusiveAction;
pub use hub::{ClientId, JobCategory, JobHub, JobKey, JobOrder};
pub use job::{JobError, JobOperation, JobState};
pub use keyed::KeyedAction;
pub use keyed_queue::KeyedQueue;
pub use latest::{GuardToken, LatestGuard};
