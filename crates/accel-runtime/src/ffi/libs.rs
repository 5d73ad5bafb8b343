//! Compute library FFI bindings: cuBLAS, cuRAND and cuDNN.
//!
//! Only the lifecycle entry points are bound; kernels that use the handles
//! live in the numeric layers.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::c_int;
#[cfg(feature = "cuda")]
use std::os::raw::c_ulonglong;

/// cuBLAS status code.
pub type cublasStatus_t = c_int;

/// cuBLAS context handle.
pub type cublasHandle_t = *mut c_void;

/// cuRAND status code.
pub type curandStatus_t = c_int;

/// cuRAND generator handle.
pub type curandGenerator_t = *mut c_void;

/// cuRAND generator type enumeration.
pub type curandRngType_t = c_int;

/// cuDNN status code.
pub type cudnnStatus_t = c_int;

/// cuDNN context handle.
pub type cudnnHandle_t = *mut c_void;

/// cuBLAS success status.
pub const CUBLAS_STATUS_SUCCESS: cublasStatus_t = 0;

/// cuRAND success status.
pub const CURAND_STATUS_SUCCESS: curandStatus_t = 0;

/// Default pseudo-random generator (XORWOW).
pub const CURAND_RNG_PSEUDO_DEFAULT: curandRngType_t = 100;

/// cuDNN success status.
pub const CUDNN_STATUS_SUCCESS: cudnnStatus_t = 0;

#[cfg(feature = "cuda")]
#[link(name = "cublas")]
extern "C" {
    /// Create a cuBLAS handle on the current context.
    pub fn cublasCreate_v2(handle: *mut cublasHandle_t) -> cublasStatus_t;

    /// Destroy a cuBLAS handle.
    pub fn cublasDestroy_v2(handle: cublasHandle_t) -> cublasStatus_t;
}

#[cfg(feature = "cuda")]
#[link(name = "curand")]
extern "C" {
    /// Create a device-side generator of the given type.
    pub fn curandCreateGenerator(
        generator: *mut curandGenerator_t,
        rng_type: curandRngType_t,
    ) -> curandStatus_t;

    /// Destroy a generator.
    pub fn curandDestroyGenerator(generator: curandGenerator_t) -> curandStatus_t;

    /// Set the seed of a pseudo-random generator.
    pub fn curandSetPseudoRandomGeneratorSeed(
        generator: curandGenerator_t,
        seed: c_ulonglong,
    ) -> curandStatus_t;

    /// Set the absolute offset of a generator.
    pub fn curandSetGeneratorOffset(
        generator: curandGenerator_t,
        offset: c_ulonglong,
    ) -> curandStatus_t;
}

#[cfg(feature = "cudnn")]
#[link(name = "cudnn")]
extern "C" {
    /// Create a cuDNN handle on the current context.
    pub fn cudnnCreate(handle: *mut cudnnHandle_t) -> cudnnStatus_t;

    /// Destroy a cuDNN handle.
    pub fn cudnnDestroy(handle: cudnnHandle_t) -> cudnnStatus_t;
}
