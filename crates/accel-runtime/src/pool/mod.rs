//! Pooled device memory allocator.
//!
//! # Overview
//!
//! Calling the device allocator for every buffer is slow and fragments
//! device memory. [`PooledAllocator`] reserves a large block per device once
//! and serves requests from it:
//!
//! - **Reservation**: `reserve_bytes`, or `reserve_fraction` of free memory
//! - **Placement**: first fit over `alignment`-sized blocks
//! - **Free**: blocks merge with free neighbours
//! - **Growth**: optional extra segments when a reservation runs out
//!
//! When the pool is not initialized every request falls through to the
//! device backend unchanged.
//!
//! [`PoolActivation`] ties the pool's lifetime to a scope.

mod activation;
mod allocator;
mod arena;
mod device_pool;
mod stats;


pub use activation::PoolActivation;
pub use allocator::PooledAllocator;
pub use stats::PoolStats;
