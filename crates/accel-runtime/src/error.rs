//! Error types and exit codes for the accelerator runtime.
//!
//! # Exit Code Mapping
//!
//! | Exit Code | Error Variant | Description |
//! |-----------|---------------|-------------|
//! | 120 | `ConfigMismatch` | Device capability requested in a host-only setup |
//! | 121 | `Unsupported` | Capability not implemented in this build |
//! | 122 | `AllocationFailed` | Device out of memory or allocator failure |
//! | 123 | `PoolExhausted` | Pool cannot serve the request and may not grow |
//! | 124 | `DeviceInitFailed` | Driver or context initialization failed |
//! | 125 | `HandleCreationFailed` | Compute library handle creation failed |
//! | 126 | `DeviceCallFailed` | A device API call returned an error |
//! | 127 | `NoDevice` | No accelerator present |
//!
//! Everything else is a caller error and maps to exit code 1.
//!
//! Fatal errors mean the current run cannot continue. They are still returned
//! as values; binaries that want the process to terminate call [`fail_fast`].

use thiserror::Error;

use crate::types::{DeviceId, DevicePtr, HandleKind, Stream};

/// Error type for runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    // === Exit Code 120 ===
    /// A device capability was requested where no device backend exists.
    #[error("Configuration mismatch: {capability} requires a device backend, but this context is host-only")]
    ConfigMismatch {
        /// What was asked for (e.g. "linear-algebra handle").
        capability: String,
    },

    // === Exit Code 121 ===
    /// The operation has no implementation in this build.
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// Operation name.
        operation: String,
    },

    // === Exit Code 122 ===
    /// The device could not satisfy an allocation.
    #[error("Device allocation failed on device {device}: requested {requested_bytes} bytes - {reason}")]
    AllocationFailed {
        /// Target device.
        device: DeviceId,
        /// Bytes requested.
        requested_bytes: usize,
        /// Free bytes reported by the device at failure time, if known.
        free_bytes: Option<usize>,
        /// Device-reported reason.
        reason: String,
    },

    // === Exit Code 123 ===
    /// The pool has no block large enough and growth is disabled.
    #[error("Memory pool exhausted on device {device}: requested {requested_bytes}, available {available_bytes}")]
    PoolExhausted {
        /// Target device.
        device: DeviceId,
        /// Bytes requested (after alignment).
        requested_bytes: usize,
        /// Free bytes left in the pool.
        available_bytes: usize,
    },

    // === Exit Code 124 ===
    /// Driver or context initialization failed.
    #[error("Device initialization failed: {reason}")]
    DeviceInitFailed {
        /// Human-readable failure reason.
        reason: String,
    },

    // === Exit Code 125 ===
    /// A compute library handle could not be created.
    #[error("Failed to create {kind} handle on device {device}: {reason}")]
    HandleCreationFailed {
        /// Requested handle kind.
        kind: HandleKind,
        /// Device the handle was requested for.
        device: DeviceId,
        /// Library-reported reason.
        reason: String,
    },

    // === Exit Code 126 ===
    /// A device API call returned a non-success status.
    #[error("Device call {call} failed with status {code}: {message}")]
    DeviceCallFailed {
        /// API entry point name.
        call: &'static str,
        /// Raw status code.
        code: i32,
        /// Decoded status.
        message: String,
    },

    // === Exit Code 127 ===
    /// No accelerator is available.
    #[error("No accelerator device available")]
    NoDevice,

    // === Caller errors (Exit Code 1) ===
    /// Device ordinal outside the visible range.
    #[error("Invalid device {device}: {device_count} device(s) visible")]
    InvalidDevice {
        /// Requested ordinal.
        device: DeviceId,
        /// Number of visible devices.
        device_count: usize,
    },

    /// `initialize()` was called before `configure()`.
    #[error("Memory pool is not configured: call configure() with a device list first")]
    PoolNotConfigured,

    /// A stream was used for pooled allocation before being registered.
    #[error("Stream {stream} is not registered with the memory pool")]
    StreamNotRegistered {
        /// Offending stream.
        stream: Stream,
    },

    /// A pointer was released that the device does not know about.
    #[error("Invalid free of {ptr} on device {device}")]
    InvalidFree {
        /// Device the free was issued against.
        device: DeviceId,
        /// Pointer passed to free.
        ptr: DevicePtr,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration file could not be read or parsed.
    #[error("Failed to load configuration from {path}: {reason}")]
    ConfigLoad {
        /// File path.
        path: String,
        /// Underlying I/O or parse error.
        reason: String,
    },
}

impl RuntimeError {
    /// Shorthand for [`RuntimeError::Unsupported`].
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Shorthand for [`RuntimeError::ConfigMismatch`].
    pub fn config_mismatch(capability: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            capability: capability.into(),
        }
    }

    /// Get the process exit code for this error.
    ///
    /// Returns 120-127 for fatal errors, 1 for caller errors.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigMismatch { .. } => 120,
            Self::Unsupported { .. } => 121,
            Self::AllocationFailed { .. } => 122,
            Self::PoolExhausted { .. } => 123,
            Self::DeviceInitFailed { .. } => 124,
            Self::HandleCreationFailed { .. } => 125,
            Self::DeviceCallFailed { .. } => 126,
            Self::NoDevice => 127,
            _ => 1,
        }
    }

    /// Check if this error means the current run cannot continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.exit_code() != 1
    }

    /// Check if this is an allocation failure (pool or device).
    ///
    /// Pool exhaustion and device out-of-memory are treated identically.
    #[must_use]
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Get the error category name for logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConfigMismatch { .. } | Self::InvalidConfig { .. } | Self::ConfigLoad { .. } => {
                "CONFIG"
            }
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::AllocationFailed { .. }
            | Self::PoolExhausted { .. }
            | Self::PoolNotConfigured
            | Self::StreamNotRegistered { .. }
            | Self::InvalidFree { .. } => "MEMORY",
            Self::DeviceInitFailed { .. }
            | Self::DeviceCallFailed { .. }
            | Self::NoDevice
            | Self::InvalidDevice { .. } => "DEVICE",
            Self::HandleCreationFailed { .. } => "HANDLE",
        }
    }

    /// Get the structured error code for logging (e.g. "ERR-ACCEL-POOL-EXHAUSTED").
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigMismatch { .. } => "ERR-ACCEL-CONFIG-MISMATCH",
            Self::Unsupported { .. } => "ERR-ACCEL-UNSUPPORTED",
            Self::AllocationFailed { .. } => "ERR-ACCEL-ALLOC",
            Self::PoolExhausted { .. } => "ERR-ACCEL-POOL-EXHAUSTED",
            Self::DeviceInitFailed { .. } => "ERR-ACCEL-DEVICE-INIT",
            Self::HandleCreationFailed { .. } => "ERR-ACCEL-HANDLE",
            Self::DeviceCallFailed { .. } => "ERR-ACCEL-DEVICE-CALL",
            Self::NoDevice => "ERR-ACCEL-NO-DEVICE",
            Self::InvalidDevice { .. } => "ERR-ACCEL-INVALID-DEVICE",
            Self::PoolNotConfigured => "ERR-ACCEL-POOL-UNCONFIGURED",
            Self::StreamNotRegistered { .. } => "ERR-ACCEL-STREAM-UNREGISTERED",
            Self::InvalidFree { .. } => "ERR-ACCEL-INVALID-FREE",
            Self::InvalidConfig { .. } => "ERR-ACCEL-CONFIG-INVALID",
            Self::ConfigLoad { .. } => "ERR-ACCEL-CONFIG-LOAD",
        }
    }
}

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Log a fatal error and terminate the process with its exit code.
///
/// For binaries that want the run to stop at the first unrecoverable device
/// failure. Library code returns the error instead.
pub fn fail_fast(err: RuntimeError) -> ! {
    tracing::error!(
        code = err.error_code(),
        category = err.category(),
        exit_code = err.exit_code(),
        "{}",
        err
    );
    std::process::exit(err.exit_code())
}
