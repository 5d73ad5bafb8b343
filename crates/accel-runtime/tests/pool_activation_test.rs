//! Integration tests for the pooled allocator and scoped activation.
//!
//! All tests run against `SimulatedDevice`, which counts every device call
//! so the tests can assert exactly which side effects happened.
//!
//! ```bash
//! cargo test -p accel-runtime --test pool_activation_test
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use accel_runtime::{
    DeviceBackend, DeviceId, PoolActivation, PoolConfig, PoolStats, PooledAllocator,
    RuntimeError, SimulatedDevice, Stream,
};

const MIB: usize = 1024 * 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn simulated(devices: usize) -> (Arc<SimulatedDevice>, PooledAllocator) {
    init_tracing();
    let backend = Arc::new(SimulatedDevice::new(devices, 256 * MIB));
    let allocator = PooledAllocator::with_config(
        backend.clone(),
        PoolConfig {
            reserve_bytes: Some(32 * MIB),
            ..PoolConfig::default()
        },
    );
    (backend, allocator)
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_configure_initialize_twice_is_noop() {
    let (backend, allocator) = simulated(1);
    allocator.configure(&[DeviceId(0)]).unwrap();
    allocator.initialize().unwrap();
    let before = backend.counters();

    allocator.initialize().unwrap();

    println!("BEFORE: {:?}", before);
    println!("AFTER:  {:?}", backend.counters());
    assert_eq!(backend.counters(), before, "second initialize reserved again");
    assert_eq!(allocator.stats().initializations, 1);
}

#[test]
fn test_two_device_baseline_round_trip() {
    let (backend, allocator) = simulated(2);
    allocator.configure(&[DeviceId(0), DeviceId(1)]).unwrap();
    allocator.initialize().unwrap();

    let stream = Stream::default_for(DeviceId(0));
    let baseline = allocator.get_info(DeviceId(0)).unwrap();

    let ptr = allocator.allocate(1024, stream).unwrap();
    assert!(!ptr.is_null());
    assert!(allocator.get_info(DeviceId(0)).unwrap().used_bytes >= 1024);

    allocator.free(ptr, stream).unwrap();
    let after = allocator.get_info(DeviceId(0)).unwrap();
    assert_eq!(after.used_bytes, baseline.used_bytes);
    assert_eq!(after.free_bytes, baseline.free_bytes);

    // Device 1 untouched by device 0 traffic.
    assert_eq!(allocator.get_info(DeviceId(1)).unwrap().used_bytes, 0);
    assert_eq!(backend.live_allocations(DeviceId(1)), 1);
}

#[test]
fn test_allocate_after_destroy_uses_device() {
    let (backend, allocator) = simulated(1);
    allocator.configure(&[DeviceId(0)]).unwrap();
    allocator.initialize().unwrap();
    allocator.destroy();
    assert_eq!(backend.live_allocations(DeviceId(0)), 0);

    let stream = Stream::default_for(DeviceId(0));
    let ptr = allocator.allocate(4096, stream).unwrap();
    assert!(!ptr.is_null());
    assert_eq!(backend.live_allocations(DeviceId(0)), 1);
    assert_eq!(allocator.stats().direct_allocations, 1);

    allocator.free(ptr, stream).unwrap();
    assert_eq!(backend.live_allocations(DeviceId(0)), 0);
}

#[test]
fn test_exhausted_pool_and_device_oom_look_the_same() {
    init_tracing();
    let backend = Arc::new(SimulatedDevice::new(1, 8 * MIB));
    let allocator = PooledAllocator::with_config(
        backend.clone(),
        PoolConfig {
            reserve_bytes: Some(MIB),
            allow_growth: false,
            ..PoolConfig::default()
        },
    );
    let stream = Stream::default_for(DeviceId(0));

    let direct_err = allocator.allocate(9 * MIB, stream).unwrap_err();

    allocator.configure(&[DeviceId(0)]).unwrap();
    allocator.initialize().unwrap();
    let pooled_err = allocator.allocate(2 * MIB, stream).unwrap_err();

    println!("direct: {}", direct_err);
    println!("pooled: {}", pooled_err);
    assert!(direct_err.is_allocation_failure() && pooled_err.is_allocation_failure());
    assert!(direct_err.is_fatal() && pooled_err.is_fatal());
    assert_eq!(direct_err.category(), pooled_err.category());
}

#[test]
fn test_growth_serves_oversized_request() {
    init_tracing();
    let backend = Arc::new(SimulatedDevice::new(1, 64 * MIB));
    let allocator = PooledAllocator::with_config(
        backend.clone(),
        PoolConfig {
            reserve_bytes: Some(MIB),
            allow_growth: true,
            growth_bytes: 4 * MIB,
            ..PoolConfig::default()
        },
    );
    allocator.configure(&[DeviceId(0)]).unwrap();
    allocator.initialize().unwrap();

    let stream = Stream::default_for(DeviceId(0));
    let ptr = allocator.allocate(2 * MIB, stream).unwrap();
    assert_eq!(backend.live_allocations(DeviceId(0)), 2);
    allocator.free(ptr, stream).unwrap();

    allocator.destroy();
    assert_eq!(backend.live_allocations(DeviceId(0)), 0);
}

// ============================================================================
// SCOPED ACTIVATION
// ============================================================================

#[test]
fn test_activation_destroys_exactly_once() {
    let (backend, allocator) = simulated(2);
    {
        let activation = PoolActivation::new(&allocator, &[DeviceId(0), DeviceId(1)]).unwrap();
        assert!(activation.using_pool());
        assert_eq!(allocator.stats().teardowns, 0);
    }
    assert_eq!(allocator.stats().teardowns, 1);
    assert!(!allocator.is_initialized());
    assert_eq!(backend.live_allocations(DeviceId(0)), 0);
    assert_eq!(backend.live_allocations(DeviceId(1)), 0);
}

#[test]
fn test_activation_destroys_during_unwinding() {
    let (backend, allocator) = simulated(1);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _activation = PoolActivation::new(&allocator, &[DeviceId(0)]).unwrap();
        assert!(allocator.is_initialized());
        panic!("worker failed mid-run");
    }));

    assert!(result.is_err());
    assert_eq!(allocator.stats().teardowns, 1);
    assert!(!allocator.is_initialized());
    assert_eq!(backend.live_allocations(DeviceId(0)), 0);
}

#[test]
fn test_activation_destroys_on_early_return() {
    fn run(allocator: &PooledAllocator) -> Result<(), RuntimeError> {
        let _activation = PoolActivation::new(allocator, &[DeviceId(0)])?;
        // Unregistered stream: the error propagates out of the scope.
        allocator.allocate(64, Stream::new(DeviceId(0), 9))?;
        Ok(())
    }

    let (_backend, allocator) = simulated(1);
    let err = run(&allocator).unwrap_err();
    assert!(matches!(err, RuntimeError::StreamNotRegistered { .. }));
    assert_eq!(allocator.stats().teardowns, 1);
    assert!(!allocator.is_initialized());
}

#[test]
fn test_empty_activation_has_no_side_effects() {
    let (backend, allocator) = simulated(2);
    {
        let activation = PoolActivation::new(&allocator, &[]).unwrap();
        assert!(!activation.using_pool());
        assert!(!allocator.is_enabled());
    }
    assert_eq!(backend.counters().memory_calls(), 0);
    assert_eq!(allocator.stats(), PoolStats::default());
}

#[test]
fn test_activation_smoke_test_is_pooled() {
    let (backend, allocator) = simulated(1);
    let _activation = PoolActivation::new(&allocator, &[DeviceId(0)]).unwrap();

    let stats = allocator.stats();
    assert_eq!(stats.pooled_allocations, 1);
    assert_eq!(stats.pooled_frees, 1);
    // Only the reservation hit the device.
    assert_eq!(backend.counters().mallocs, 1);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_concurrent_workers_on_separate_devices() {
    init_tracing();
    let backend = Arc::new(SimulatedDevice::new(4, 256 * MIB));
    let allocator = Arc::new(PooledAllocator::with_config(
        backend.clone(),
        PoolConfig {
            reserve_bytes: Some(16 * MIB),
            allow_growth: false,
            ..PoolConfig::default()
        },
    ));
    let devices: Vec<DeviceId> = (0..4).map(DeviceId).collect();
    allocator.configure(&devices).unwrap();
    allocator.initialize().unwrap();

    let workers: Vec<_> = devices
        .iter()
        .map(|&device| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let stream = Stream::default_for(device);
                for round in 0..200 {
                    let ptrs: Vec<_> = (1..=8)
                        .map(|i| allocator.allocate(i * 1000 + round, stream).unwrap())
                        .collect();
                    for ptr in ptrs {
                        allocator.free(ptr, stream).unwrap();
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    for &device in &devices {
        assert_eq!(allocator.get_info(device).unwrap().used_bytes, 0);
    }
    let stats = allocator.stats();
    assert_eq!(stats.pooled_allocations, 4 * 200 * 8);
    assert_eq!(stats.outstanding(), 0);
    // One reservation per device, nothing else.
    assert_eq!(backend.counters().mallocs, 4);
}

#[test]
fn test_concurrent_workers_share_one_device() {
    let (_backend, allocator) = simulated(1);
    let allocator = Arc::new(allocator);
    allocator.configure(&[DeviceId(0)]).unwrap();
    allocator.initialize().unwrap();

    let streams: Vec<Stream> = (1..=4).map(|id| Stream::new(DeviceId(0), id)).collect();
    for &stream in &streams {
        allocator.register_stream(stream).unwrap();
    }

    let workers: Vec<_> = streams
        .iter()
        .map(|&stream| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                for _ in 0..100 {
                    let ptr = allocator.allocate(4096, stream).unwrap();
                    allocator.free(ptr, stream).unwrap();
                }
                allocator.in_use_on(stream)
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 0);
    }
    assert_eq!(allocator.get_info(DeviceId(0)).unwrap().used_bytes, 0);
}

#[test]
fn test_stats_serialize() {
    let (_backend, allocator) = simulated(1);
    let _activation = PoolActivation::new(&allocator, &[DeviceId(0)]).unwrap();

    let json = serde_json::to_value(allocator.stats()).unwrap();
    assert_eq!(json["initializations"], 1);
    assert_eq!(json["pooled_allocations"], 1);
}

#[test]
fn test_backend_trait_object_usable() {
    let backend: Arc<dyn DeviceBackend> = Arc::new(SimulatedDevice::new(1, MIB));
    let allocator = PooledAllocator::new(backend);
    assert_eq!(allocator.backend().name(), "simulated");
    assert_eq!(allocator.get_info(DeviceId(0)).unwrap().free_bytes, MIB);
}
