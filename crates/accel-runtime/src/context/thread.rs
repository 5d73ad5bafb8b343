//! Thread-scoped execution context accessor.
//!
//! For callers that want "one context per thread, created on first use,
//! released at thread exit" without threading an [`ExecutionContext`]
//! through their code.

use std::cell::RefCell;

use tracing::{debug, warn};

use super::execution::ExecutionContext;
use crate::config::RuntimeConfig;
use crate::global;

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

fn new_thread_context() -> ExecutionContext {
    let backend = global::backend();
    let config = global::config();
    match ExecutionContext::from_config(backend.clone(), &config) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "Configured thread context rejected, using defaults");
            match backend {
                Some(backend) => ExecutionContext::with_backend(backend),
                None => ExecutionContext::host_only(),
            }
        }
    }
}

/// Run `f` with the calling thread's execution context.
///
/// The context is created on first use from the globally installed backend
/// and configuration (host-only when no backend is installed), and dropped
/// when the thread exits.
///
/// # Panics
///
/// Panics if called from inside `f` on the same thread.
///
/// # Example
///
/// ```
/// use accel_runtime::{with_thread_context, ExecutionMode};
///
/// with_thread_context(|ctx| ctx.set_mode(ExecutionMode::DeviceAccelerated));
/// let mode = with_thread_context(|ctx| ctx.mode());
/// assert_eq!(mode, ExecutionMode::DeviceAccelerated);
/// ```
pub fn with_thread_context<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
    THREAD_CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot.get_or_insert_with(|| {
            debug!(thread = ?std::thread::current().id(), "Creating thread execution context");
            new_thread_context()
        });
        f(ctx)
    })
}

/// Drop the calling thread's context now instead of at thread exit.
///
/// The next [`with_thread_context`] call creates a fresh one.
pub fn reset_thread_context() {
    THREAD_CONTEXT.with(|cell| {
        cell.borrow_mut().take();
    });
}

/// Replace the calling thread's context with one built from `config`.
///
/// # Errors
///
/// - `RuntimeError::InvalidDevice` if `config.device_id` is not visible
pub fn configure_thread_context(config: &RuntimeConfig) -> crate::error::RuntimeResult<()> {
    let ctx = ExecutionContext::from_config(global::backend(), config)?;
    THREAD_CONTEXT.with(|cell| {
        *cell.borrow_mut() = Some(ctx);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionMode;

    #[test]
    fn test_mode_is_per_thread() {
        reset_thread_context();
        with_thread_context(|ctx| ctx.set_mode(ExecutionMode::DeviceAccelerated));

        let other = std::thread::spawn(|| with_thread_context(|ctx| ctx.mode()))
            .join()
            .unwrap();

        assert_eq!(other, ExecutionMode::HostOnly);
        assert_eq!(
            with_thread_context(|ctx| ctx.mode()),
            ExecutionMode::DeviceAccelerated
        );
        reset_thread_context();
    }

    #[test]
    fn test_reset_creates_fresh_context() {
        with_thread_context(|ctx| ctx.set_solver_count(8));
        reset_thread_context();
        assert_eq!(with_thread_context(|ctx| ctx.solver_count()), 1);
    }
}
