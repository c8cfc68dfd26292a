//! `taskmill-core` — job model and queue semantics.
//!
//! This crate holds the **pure** parts of the queue: the `Job` record and its
//! state machine, retry/backoff math, handler outcomes and the error taxonomy.
//! Nothing here performs I/O; stores and workers build on top of it.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod outcome;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};
pub use job::{EnqueueOptions, Job, JobState, JobStats};
pub use outcome::{HandlerError, Outcome};
pub use retry::{Backoff, RetryPolicy};
