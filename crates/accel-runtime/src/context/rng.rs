//! Shared random-number facade.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::types::ComputeHandle;

#[derive(Debug)]
struct RngState {
    host: ChaCha8Rng,
    seed: u64,
    device_generator: Option<ComputeHandle>,
}

/// Random stream of an [`ExecutionContext`](crate::ExecutionContext).
///
/// Wraps a host generator and, once the context has created one, the device
/// generator handle. Clones share state: drawing from one clone advances
/// all of them, and reseeding through the context is visible to every clone.
///
/// # Example
///
/// ```
/// use accel_runtime::ExecutionContext;
/// use rand::RngCore;
///
/// let mut ctx = ExecutionContext::host_only();
/// ctx.set_random_seed(42)?;
/// let mut a = ctx.rng_stream();
/// let mut b = a.clone();
/// let first = a.next_u64();
/// assert_ne!(first, b.next_u64());
/// # Ok::<(), accel_runtime::RuntimeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct RngStream {
    state: Arc<Mutex<RngState>>,
}

impl RngStream {
    pub(crate) fn from_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(RngState {
                host: ChaCha8Rng::seed_from_u64(seed),
                seed,
                device_generator: None,
            })),
        }
    }

    pub(crate) fn from_entropy() -> Self {
        Self::from_seed(rand::random::<u64>())
    }

    pub(crate) fn reseed(&self, seed: u64) {
        let mut state = self.state.lock();
        state.host = ChaCha8Rng::seed_from_u64(seed);
        state.seed = seed;
    }

    pub(crate) fn attach_device_generator(&self, handle: Option<ComputeHandle>) {
        self.state.lock().device_generator = handle;
    }

    /// Seed the host generator was last seeded with.
    pub fn seed(&self) -> u64 {
        self.state.lock().seed
    }

    /// Device generator handle, if the owning context created one.
    pub fn device_generator(&self) -> Option<ComputeHandle> {
        self.state.lock().device_generator
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        // 53 random mantissa bits
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

impl RngCore for RngStream {
    fn next_u32(&mut self) -> u32 {
        self.state.lock().host.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.state.lock().host.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.state.lock().host.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.state.lock().host.try_fill_bytes(dest)
    }
}
