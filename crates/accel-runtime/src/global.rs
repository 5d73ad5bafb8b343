//! Process-global install points.
//!
//! Optional. Code that passes a [`PooledAllocator`] and a backend around
//! explicitly never needs this module. Binaries that want exactly one
//! allocator per process install it once at startup:
//!
//! ```
//! use std::sync::Arc;
//! use accel_runtime::{global, DeviceId, PoolActivation, SimulatedDevice};
//!
//! global::install_backend(Arc::new(SimulatedDevice::new(1, 1 << 20)));
//! let allocator = global::allocator()?;
//! let _pool = PoolActivation::new(allocator, &[DeviceId(0)])?;
//! # Ok::<(), accel_runtime::RuntimeError>(())
//! ```
//!
//! # Thread Safety
//!
//! `OnceLock` ensures single initialization across all threads. The first
//! install wins; later installs are ignored and report `false`.

use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::device::DeviceBackend;
use crate::error::{RuntimeError, RuntimeResult};
use crate::pool::PooledAllocator;

static GLOBAL_BACKEND: OnceLock<Arc<dyn DeviceBackend>> = OnceLock::new();
static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
static GLOBAL_ALLOCATOR: OnceLock<PooledAllocator> = OnceLock::new();

/// Install the process-wide device backend.
///
/// Returns `false` if a backend was already installed.
pub fn install_backend(backend: Arc<dyn DeviceBackend>) -> bool {
    let name = backend.name();
    let installed = GLOBAL_BACKEND.set(backend).is_ok();
    if installed {
        info!(backend = name, "Installed global device backend");
    } else {
        debug!(backend = name, "Global device backend already installed, ignoring");
    }
    installed
}

/// The installed backend, if any.
pub fn backend() -> Option<Arc<dyn DeviceBackend>> {
    GLOBAL_BACKEND.get().cloned()
}

/// Install the process-wide configuration.
///
/// Returns `false` if a configuration was already installed.
pub fn install_config(config: RuntimeConfig) -> bool {
    GLOBAL_CONFIG.set(config).is_ok()
}

/// The installed configuration, or defaults.
pub fn config() -> RuntimeConfig {
    GLOBAL_CONFIG.get().cloned().unwrap_or_default()
}

/// Install the process-wide allocator.
///
/// Returns `false` if an allocator was already installed or created.
pub fn install_allocator(allocator: PooledAllocator) -> bool {
    let installed = GLOBAL_ALLOCATOR.set(allocator).is_ok();
    if !installed {
        debug!("Global allocator already installed, ignoring");
    }
    installed
}

/// The process-wide allocator.
///
/// Created on first call from the installed backend and the installed
/// configuration's pool settings, unless one was installed explicitly.
///
/// # Errors
///
/// - `RuntimeError::ConfigMismatch` if neither an allocator nor a backend
///   has been installed
pub fn allocator() -> RuntimeResult<&'static PooledAllocator> {
    if let Some(allocator) = GLOBAL_ALLOCATOR.get() {
        return Ok(allocator);
    }

    let backend = backend().ok_or_else(|| RuntimeError::config_mismatch("global allocator"))?;
    Ok(GLOBAL_ALLOCATOR.get_or_init(|| PooledAllocator::with_config(backend, config().pool)))
}
