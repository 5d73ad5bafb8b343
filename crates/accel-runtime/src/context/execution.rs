//! Per-worker execution context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::rng::RngStream;
use crate::config::RuntimeConfig;
use crate::device::DeviceBackend;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{ComputeHandle, DeviceId, DeviceProperties, HandleKind};

/// Where numeric layers run their work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Host computation only.
    #[default]
    HostOnly,
    /// Offload to the bound device.
    DeviceAccelerated,
}

impl ExecutionMode {
    /// Get the human-readable name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostOnly => "host-only",
            Self::DeviceAccelerated => "device-accelerated",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state owned by one worker thread.
///
/// Holds the compute library handles for the bound device, the execution
/// mode, the random stream and the multi-worker coordination counters.
/// Methods that mutate take `&mut self`; the context is `Send` so it can be
/// built on one thread and moved to its worker, but it is never shared.
///
/// Handles are created on first request and released when the context is
/// rebound to another device or dropped.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use accel_runtime::{ExecutionContext, ExecutionMode, HandleKind, SimulatedDevice};
///
/// let mut ctx = ExecutionContext::with_backend(Arc::new(SimulatedDevice::new(1, 1 << 20)));
/// ctx.set_mode(ExecutionMode::DeviceAccelerated);
/// let blas = ctx.handle(HandleKind::LinearAlgebra)?;
/// assert_eq!(blas, ctx.handle(HandleKind::LinearAlgebra)?);
/// # Ok::<(), accel_runtime::RuntimeError>(())
/// ```
pub struct ExecutionContext {
    backend: Option<Arc<dyn DeviceBackend>>,
    mode: ExecutionMode,
    device: DeviceId,
    handles: HashMap<HandleKind, ComputeHandle>,
    rng: Option<RngStream>,
    /// Last seed set explicitly; applied to device generators created later.
    seed: Option<u64>,
    solver_count: usize,
    root_solver: bool,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("mode", &self.mode)
            .field("device", &self.device)
            .field("handles", &self.handles.len())
            .field("seed", &self.seed)
            .field("solver_count", &self.solver_count)
            .field("root_solver", &self.root_solver)
            .finish()
    }
}

impl ExecutionContext {
    fn build(backend: Option<Arc<dyn DeviceBackend>>) -> Self {
        Self {
            backend,
            mode: ExecutionMode::HostOnly,
            device: DeviceId(0),
            handles: HashMap::new(),
            rng: None,
            seed: None,
            solver_count: 1,
            root_solver: true,
        }
    }

    /// Context with no device backend. Device requests fail with
    /// `RuntimeError::ConfigMismatch`.
    #[must_use]
    pub fn host_only() -> Self {
        Self::build(None)
    }

    /// Context bound to device 0 of `backend`, in host-only mode.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn DeviceBackend>) -> Self {
        Self::build(Some(backend))
    }

    /// Context set up from `config`: mode, device and seed.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidDevice` if `config.device_id` is not visible
    pub fn from_config(
        backend: Option<Arc<dyn DeviceBackend>>,
        config: &RuntimeConfig,
    ) -> RuntimeResult<Self> {
        let mut ctx = Self::build(backend);
        ctx.mode = config.default_mode;
        if let Some(backend) = &ctx.backend {
            backend.check_device(config.device_id)?;
            ctx.device = config.device_id;
        }
        if let Some(seed) = config.random_seed {
            ctx.set_random_seed(seed)?;
        }
        Ok(ctx)
    }

    /// Check if a device backend is attached.
    pub fn has_device(&self) -> bool {
        self.backend.is_some()
    }

    fn require_backend(&self, capability: impl Into<String>) -> RuntimeResult<Arc<dyn DeviceBackend>> {
        self.backend
            .clone()
            .ok_or_else(|| RuntimeError::config_mismatch(capability))
    }

    // =========================================================================
    // HANDLES
    // =========================================================================

    /// Handle of `kind` on the bound device, created on first call.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::Unsupported` for `NeuralNet` without the `cudnn` feature
    /// - `RuntimeError::ConfigMismatch` if the context is host-only
    /// - backend errors from handle creation
    pub fn handle(&mut self, kind: HandleKind) -> RuntimeResult<ComputeHandle> {
        if kind == HandleKind::NeuralNet && !cfg!(feature = "cudnn") {
            return Err(RuntimeError::unsupported(
                "neural-net primitives (built without the `cudnn` feature)",
            ));
        }

        if let Some(handle) = self.handles.get(&kind) {
            return Ok(*handle);
        }

        let backend = self.require_backend(format!("{} handle", kind))?;
        let raw = backend.create_handle(self.device, kind)?;
        let handle = ComputeHandle::new(kind, self.device, raw);

        if kind == HandleKind::RandomGeneration {
            let seed = self.seed.unwrap_or_else(rand::random::<u64>);
            if let Err(e) = backend.seed_generator(self.device, raw, seed) {
                if let Err(release) = backend.destroy_handle(self.device, kind, raw) {
                    warn!(kind = %kind, error = %release, "Failed to release unseeded generator");
                }
                return Err(e);
            }
            if let Some(rng) = &self.rng {
                rng.attach_device_generator(Some(handle));
            }
        }

        debug!(kind = %kind, device = self.device.0, "Created compute handle");
        self.handles.insert(kind, handle);
        Ok(handle)
    }

    /// Linear-algebra (cuBLAS) handle.
    pub fn linear_algebra_handle(&mut self) -> RuntimeResult<ComputeHandle> {
        self.handle(HandleKind::LinearAlgebra)
    }

    /// Device random generator (cuRAND) handle.
    pub fn rng_generator_handle(&mut self) -> RuntimeResult<ComputeHandle> {
        self.handle(HandleKind::RandomGeneration)
    }

    /// Neural-net primitives (cuDNN) handle.
    pub fn neural_net_handle(&mut self) -> RuntimeResult<ComputeHandle> {
        self.handle(HandleKind::NeuralNet)
    }

    fn release_handles(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        if let Some(rng) = &self.rng {
            rng.attach_device_generator(None);
        }
        let Some(backend) = self.backend.clone() else {
            self.handles.clear();
            return;
        };
        for (kind, handle) in self.handles.drain() {
            if let Err(e) = backend.destroy_handle(handle.device(), kind, handle.raw()) {
                warn!(
                    kind = %kind,
                    device = handle.device().0,
                    error = %e,
                    "Failed to release compute handle"
                );
            }
        }
    }

    // =========================================================================
    // RANDOM NUMBERS
    // =========================================================================

    /// Random stream, created from entropy on first access.
    ///
    /// The returned value shares state with the context's stream.
    pub fn rng_stream(&mut self) -> RngStream {
        if let Some(rng) = &self.rng {
            return rng.clone();
        }
        let rng = match self.seed {
            Some(seed) => RngStream::from_seed(seed),
            None => RngStream::from_entropy(),
        };
        rng.attach_device_generator(self.handles.get(&HandleKind::RandomGeneration).copied());
        self.rng = Some(rng.clone());
        rng
    }

    /// Reseed the host stream and the device generator.
    ///
    /// A device generator that does not exist yet is seeded with `seed`
    /// when it is created.
    ///
    /// # Errors
    ///
    /// - backend errors from reseeding an existing device generator; the
    ///   previous seed then stays in effect for host and device alike
    pub fn set_random_seed(&mut self, seed: u64) -> RuntimeResult<()> {
        // Nothing is committed until the device generator accepted the seed.
        if let Some(generator) = self.handles.get(&HandleKind::RandomGeneration) {
            if let Some(backend) = &self.backend {
                backend.seed_generator(generator.device(), generator.raw(), seed)?;
            }
        }
        self.seed = Some(seed);

        match &self.rng {
            Some(rng) => rng.reseed(seed),
            None => {
                let rng = RngStream::from_seed(seed);
                rng.attach_device_generator(
                    self.handles.get(&HandleKind::RandomGeneration).copied(),
                );
                self.rng = Some(rng);
            }
        }

        debug!(seed, "Random seed set");
        Ok(())
    }

    // =========================================================================
    // MODE & DEVICE
    // =========================================================================

    /// Current execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Switch execution mode.
    ///
    /// Not guarded: switching while device buffers from the other mode are
    /// live is the caller's responsibility.
    pub fn set_mode(&mut self, mode: ExecutionMode) {
        if mode != self.mode {
            debug!(from = %self.mode, to = %mode, "Execution mode changed");
        }
        self.mode = mode;
    }

    /// Device this context is bound to.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Bind to `device`.
    ///
    /// Same device is a no-op. Otherwise existing handles are released and
    /// recreated lazily on the new device.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::ConfigMismatch` if the context is host-only
    /// - `RuntimeError::InvalidDevice` if `device` is not visible
    pub fn set_device(&mut self, device: DeviceId) -> RuntimeResult<()> {
        let backend = self.require_backend("device binding")?;
        if device == self.device {
            return Ok(());
        }
        backend.check_device(device)?;

        self.release_handles();
        info!(from = self.device.0, to = device.0, "Rebound execution context");
        self.device = device;
        Ok(())
    }

    /// Log and return the properties of the bound device.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::ConfigMismatch` if the context is host-only
    pub fn device_query(&self) -> RuntimeResult<DeviceProperties> {
        let backend = self.require_backend("device query")?;
        let props = backend.properties(self.device)?;

        info!(device = props.device.0, "Device id:                     {}", props.device);
        info!("Name:                          {}", props.name);
        info!(
            "Compute capability:            {}.{}",
            props.compute_capability.0, props.compute_capability.1
        );
        info!("Total global memory:           {}", props.total_memory_bytes);
        info!("Total shared memory per block: {}", props.shared_memory_per_block);
        info!("Total registers per block:     {}", props.registers_per_block);
        info!("Warp size:                     {}", props.warp_size);
        info!("Maximum threads per block:     {}", props.max_threads_per_block);
        info!(
            "Maximum dimension of block:    {}, {}, {}",
            props.max_block_dims[0], props.max_block_dims[1], props.max_block_dims[2]
        );
        info!(
            "Maximum dimension of grid:     {}, {}, {}",
            props.max_grid_dims[0], props.max_grid_dims[1], props.max_grid_dims[2]
        );
        info!("Clock rate:                    {}", props.clock_rate_khz);
        info!("Number of multiprocessors:     {}", props.multiprocessor_count);
        info!(
            "Kernel execution timeout:      {}",
            if props.kernel_timeout_enabled { "Yes" } else { "No" }
        );

        Ok(props)
    }

    // =========================================================================
    // MULTI-WORKER COORDINATION
    // =========================================================================

    /// Number of cooperating workers (advisory).
    pub fn solver_count(&self) -> usize {
        self.solver_count
    }

    pub fn set_solver_count(&mut self, count: usize) {
        self.solver_count = count;
    }

    /// Whether this worker is the primary one (advisory).
    pub fn root_solver(&self) -> bool {
        self.root_solver
    }

    pub fn set_root_solver(&mut self, root: bool) {
        self.root_solver = root;
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release_handles();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::device::SimulatedDevice;
    use crate::types::{DeviceMemory, DevicePtr, RawHandle};
    use rand::RngCore;

    fn simulated(devices: usize) -> (Arc<SimulatedDevice>, ExecutionContext) {
        let backend = Arc::new(SimulatedDevice::new(devices, 1 << 20));
        let ctx = ExecutionContext::with_backend(backend.clone());
        (backend, ctx)
    }

    /// Simulated device whose generator reseeding can be switched off.
    #[derive(Debug)]
    struct FlakyReseed {
        inner: SimulatedDevice,
        reject: AtomicBool,
    }

    impl DeviceBackend for FlakyReseed {
        fn name(&self) -> &'static str {
            "flaky-reseed"
        }

        fn device_count(&self) -> usize {
            self.inner.device_count()
        }

        fn properties(&self, device: DeviceId) -> RuntimeResult<DeviceProperties> {
            self.inner.properties(device)
        }

        fn mem_info(&self, device: DeviceId) -> RuntimeResult<DeviceMemory> {
            self.inner.mem_info(device)
        }

        fn malloc(&self, device: DeviceId, bytes: usize) -> RuntimeResult<DevicePtr> {
            self.inner.malloc(device, bytes)
        }

        fn free(&self, device: DeviceId, ptr: DevicePtr) -> RuntimeResult<()> {
            self.inner.free(device, ptr)
        }

        fn create_handle(&self, device: DeviceId, kind: HandleKind) -> RuntimeResult<RawHandle> {
            self.inner.create_handle(device, kind)
        }

        fn destroy_handle(
            &self,
            device: DeviceId,
            kind: HandleKind,
            handle: RawHandle,
        ) -> RuntimeResult<()> {
            self.inner.destroy_handle(device, kind, handle)
        }

        fn seed_generator(
            &self,
            device: DeviceId,
            handle: RawHandle,
            seed: u64,
        ) -> RuntimeResult<()> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(RuntimeError::DeviceCallFailed {
                    call: "seed_generator",
                    code: 201,
                    message: "generator rejected seed".to_string(),
                });
            }
            self.inner.seed_generator(device, handle, seed)
        }
    }

    #[test]
    fn test_defaults() {
        let ctx = ExecutionContext::host_only();
        assert_eq!(ctx.mode(), ExecutionMode::HostOnly);
        assert_eq!(ctx.solver_count(), 1);
        assert!(ctx.root_solver());
        assert!(!ctx.has_device());
    }

    #[test]
    fn test_host_only_handle_is_config_mismatch() {
        let mut ctx = ExecutionContext::host_only();
        let err = ctx.handle(HandleKind::LinearAlgebra).unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigMismatch { .. }));
        assert!(err.is_fatal());
        assert!(ctx.device_query().is_err());
        assert!(ctx.set_device(DeviceId(0)).is_err());
    }

    #[test]
    fn test_handles_created_once() {
        let (backend, mut ctx) = simulated(1);
        let a = ctx.handle(HandleKind::LinearAlgebra).unwrap();
        let b = ctx.handle(HandleKind::LinearAlgebra).unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.counters().handles_created, 1);
    }

    #[cfg(not(feature = "cudnn"))]
    #[test]
    fn test_neural_net_unsupported_without_feature() {
        let (backend, mut ctx) = simulated(1);
        let err = ctx.neural_net_handle().unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported { .. }));
        assert_eq!(backend.counters().handles_created, 0);
    }

    #[test]
    fn test_drop_releases_handles() {
        let (backend, mut ctx) = simulated(1);
        ctx.linear_algebra_handle().unwrap();
        ctx.rng_generator_handle().unwrap();
        assert_eq!(backend.live_handles(), 2);

        drop(ctx);
        assert_eq!(backend.live_handles(), 0);
        assert_eq!(backend.counters().handles_destroyed, 2);
    }

    #[test]
    fn test_set_device_same_is_noop() {
        let (backend, mut ctx) = simulated(2);
        let h = ctx.linear_algebra_handle().unwrap();
        ctx.set_device(DeviceId(0)).unwrap();
        assert_eq!(ctx.linear_algebra_handle().unwrap(), h);
        assert_eq!(backend.counters().handles_destroyed, 0);
    }

    #[test]
    fn test_set_device_recreates_handles() {
        let (backend, mut ctx) = simulated(2);
        let old = ctx.linear_algebra_handle().unwrap();

        ctx.set_device(DeviceId(1)).unwrap();
        assert_eq!(backend.counters().handles_destroyed, 1);

        let new = ctx.linear_algebra_handle().unwrap();
        assert_ne!(old, new);
        assert_eq!(new.device(), DeviceId(1));
    }

    #[test]
    fn test_set_device_unknown_fails() {
        let (_backend, mut ctx) = simulated(2);
        let err = ctx.set_device(DeviceId(5)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidDevice { .. }));
        assert_eq!(ctx.device(), DeviceId(0));
    }

    #[test]
    fn test_seed_applies_to_device_generator() {
        let (backend, mut ctx) = simulated(1);
        ctx.set_random_seed(1701).unwrap();
        let gen = ctx.rng_generator_handle().unwrap();
        assert_eq!(backend.generator_seed(gen.raw()), Some(1701));

        ctx.set_random_seed(42).unwrap();
        assert_eq!(backend.generator_seed(gen.raw()), Some(42));
        assert_eq!(ctx.rng_stream().device_generator(), Some(gen));
    }

    #[test]
    fn test_seed_reproduces_host_draws() {
        let mut a = ExecutionContext::host_only();
        let mut b = ExecutionContext::host_only();
        a.set_random_seed(7).unwrap();
        b.set_random_seed(7).unwrap();

        let mut ra = a.rng_stream();
        let mut rb = b.rng_stream();
        for _ in 0..8 {
            assert_eq!(ra.next_u64(), rb.next_u64());
        }
    }

    #[test]
    fn test_reseed_restarts_sequence() {
        let mut ctx = ExecutionContext::host_only();
        ctx.set_random_seed(5).unwrap();
        let mut rng = ctx.rng_stream();
        let first = rng.next_u64();

        ctx.set_random_seed(5).unwrap();
        assert_eq!(rng.next_u64(), first);
    }

    #[test]
    fn test_device_query_returns_properties() {
        let (_backend, ctx) = simulated(1);
        let props = ctx.device_query().unwrap();
        assert_eq!(props.device, DeviceId(0));
        assert_eq!(props.warp_size, 32);
    }

    #[test]
    fn test_from_config() {
        let backend: Arc<dyn DeviceBackend> = Arc::new(SimulatedDevice::new(2, 1 << 20));
        let config = RuntimeConfig {
            default_mode: ExecutionMode::DeviceAccelerated,
            random_seed: Some(11),
            device_id: DeviceId(1),
            ..RuntimeConfig::default()
        };
        let mut ctx = ExecutionContext::from_config(Some(backend.clone()), &config).unwrap();
        assert_eq!(ctx.mode(), ExecutionMode::DeviceAccelerated);
        assert_eq!(ctx.device(), DeviceId(1));
        assert_eq!(ctx.rng_stream().seed(), 11);

        let bad = RuntimeConfig {
            device_id: DeviceId(4),
            ..RuntimeConfig::default()
        };
        assert!(ExecutionContext::from_config(Some(backend), &bad).is_err());
    }

    #[test]
    fn test_solver_counters() {
        let mut ctx = ExecutionContext::host_only();
        ctx.set_solver_count(4);
        ctx.set_root_solver(false);
        assert_eq!(ctx.solver_count(), 4);
        assert!(!ctx.root_solver());
    }
    #[test]
    fn test_failed_device_reseed_keeps_previous_seed() {
        let backend = Arc::new(FlakyReseed {
            inner: SimulatedDevice::new(1, 1 << 20),
            reject: AtomicBool::new(false),
        });
        let mut ctx = ExecutionContext::with_backend(backend.clone());
        ctx.set_random_seed(5).unwrap();
        let gen = ctx.rng_generator_handle().unwrap();
        assert_eq!(backend.inner.generator_seed(gen.raw()), Some(5));

        backend.reject.store(true, Ordering::SeqCst);
        let err = ctx.set_random_seed(9).unwrap_err();
        assert!(matches!(err, RuntimeError::DeviceCallFailed { .. }));

        // Host and device both stay on the old seed.
        let mut host = ctx.rng_stream();
        assert_eq!(host.seed(), 5);
        assert_eq!(backend.inner.generator_seed(gen.raw()), Some(5));
        let mut reference = RngStream::from_seed(5);
        assert_eq!(host.next_u64(), reference.next_u64());

        backend.reject.store(false, Ordering::SeqCst);
        ctx.set_random_seed(9).unwrap();
        assert_eq!(ctx.rng_stream().seed(), 9);
        assert_eq!(backend.inner.generator_seed(gen.raw()), Some(9));
    }
}
