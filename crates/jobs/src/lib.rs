//! Queue manager, handler registry, dispatcher and worker pool.
//!
//! ## Components
//!
//! - `HandlerRegistry`: maps job types to application handlers
//! - `QueueManager`: enqueue/cancel, outcome routing, reclaim sweeps, events
//! - `WorkerPool`: dispatcher loop + executor slots + reclaim sweeper
//!
//! The store (see `taskmill-infra`) is the only authority on job state; nothing
//! in this crate keeps an in-memory queue.

pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;

pub use dispatcher::{DispatcherConfig, PollBackoff, RoundRobin, TypeLimits};
pub use pool::{PoolConfig, PoolHandle, PoolStats, WorkerPool};
pub use queue::{QueueConfig, QueueManager};
pub use registry::{FnHandler, HandlerRegistry, JobContext, JobHandler, handler_fn};
pub use retry::{StoreRetry, with_store_retry};
