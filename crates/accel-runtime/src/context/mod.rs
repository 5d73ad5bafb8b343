//! Execution contexts.
//!
//! An [`ExecutionContext`] belongs to one worker thread and owns that
//! worker's compute library handles, execution mode, random stream and
//! coordination counters. It does not depend on the allocator.
//!
//! Pass contexts explicitly, or use [`with_thread_context`] for one context
//! per thread that lives until the thread exits.

mod execution;
mod rng;
mod thread;

pub use execution::{ExecutionContext, ExecutionMode};
pub use rng::RngStream;
pub use thread::{configure_thread_context, reset_thread_context, with_thread_context};
