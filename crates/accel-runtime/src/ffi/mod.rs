//! CUDA FFI bindings - SINGLE SOURCE OF TRUTH.
//!
//! ALL device `extern "C"` declarations live in this module; nothing else in
//! the crate declares FFI.
//!
//! # Safety
//!
//! All functions in this module are unsafe FFI. Callers must ensure:
//! - cuInit() called before any other driver function
//! - Valid device ordinals passed to device functions
//! - A current context before creating library handles
//!
//! # Feature Flags
//!
//! - `cuda`: driver API, cuBLAS and cuRAND declarations
//! - `cudnn`: cuDNN declarations
//!
//! Without `cuda` only the constants and result helpers are compiled.

pub mod cuda_driver;
pub mod libs;

pub use cuda_driver::*;
pub use libs::*;
