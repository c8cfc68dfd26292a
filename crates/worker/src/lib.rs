//! `taskmill-worker` — command line front end for the job queue.
//!
//! `run` starts a worker pool; the other subcommands are one-shot operations
//! against the same store (`migrate`, `enqueue`, `cancel`, `stats`, `reclaim`).

pub mod cli;
pub mod commands;
pub mod handlers;

pub use cli::{Cli, Command};
pub use commands::execute;
