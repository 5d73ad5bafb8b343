//! Integration tests for per-worker execution contexts.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use accel_runtime::{
    with_thread_context, DeviceBackend, DeviceId, ExecutionContext, ExecutionMode, HandleKind,
    RuntimeError, SimulatedDevice,
};
use rand::RngCore;

fn backend(devices: usize) -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::new(devices, 1 << 24))
}

// ============================================================================
// RANDOM STREAMS
// ============================================================================

#[test]
fn test_same_seed_reproduces_draws_across_contexts() {
    let device = backend(1);
    let mut a = ExecutionContext::with_backend(device.clone());
    let mut b = ExecutionContext::with_backend(device.clone());

    a.set_random_seed(1701).unwrap();
    b.set_random_seed(1701).unwrap();

    let xs: Vec<u64> = {
        let mut rng = a.rng_stream();
        (0..32).map(|_| rng.next_u64()).collect()
    };
    let ys: Vec<u64> = {
        let mut rng = b.rng_stream();
        (0..32).map(|_| rng.next_u64()).collect()
    };
    assert_eq!(xs, ys);

    // Device generators carry the same seed.
    let ga = a.rng_generator_handle().unwrap();
    let gb = b.rng_generator_handle().unwrap();
    assert_ne!(ga, gb);
    assert_eq!(device.generator_seed(ga.raw()), Some(1701));
    assert_eq!(device.generator_seed(gb.raw()), Some(1701));
}

#[test]
fn test_unseeded_contexts_diverge() {
    let mut a = ExecutionContext::host_only();
    let mut b = ExecutionContext::host_only();
    let xs: Vec<u64> = {
        let mut rng = a.rng_stream();
        (0..4).map(|_| rng.next_u64()).collect()
    };
    let ys: Vec<u64> = {
        let mut rng = b.rng_stream();
        (0..4).map(|_| rng.next_u64()).collect()
    };
    assert_ne!(xs, ys);
}

#[test]
fn test_rng_stream_clones_share_state() {
    let mut ctx = ExecutionContext::host_only();
    ctx.set_random_seed(3).unwrap();
    let mut first = ctx.rng_stream();
    let mut second = ctx.rng_stream();

    let mut reference = ExecutionContext::host_only();
    reference.set_random_seed(3).unwrap();
    let mut expected = reference.rng_stream();

    assert_eq!(first.next_u64(), expected.next_u64());
    assert_eq!(second.next_u64(), expected.next_u64());
}

// ============================================================================
// MODE & THREADS
// ============================================================================

#[test]
fn test_mode_round_trip_independent_per_thread() {
    let workers: Vec<_> = [ExecutionMode::HostOnly, ExecutionMode::DeviceAccelerated]
        .into_iter()
        .cycle()
        .take(8)
        .map(|mode| {
            thread::spawn(move || {
                with_thread_context(|ctx| ctx.set_mode(mode));
                thread::yield_now();
                (mode, with_thread_context(|ctx| ctx.mode()))
            })
        })
        .collect();

    for worker in workers {
        let (set, observed) = worker.join().unwrap();
        assert_eq!(set, observed);
    }
}

#[test]
fn test_two_threads_get_distinct_handles() {
    let device = backend(1);

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let device: Arc<dyn DeviceBackend> = device.clone();
            thread::spawn(move || {
                let mut ctx = ExecutionContext::with_backend(device);
                let handle = ctx.handle(HandleKind::LinearAlgebra).unwrap();
                // Stable within the thread.
                assert_eq!(handle, ctx.handle(HandleKind::LinearAlgebra).unwrap());
                handle.raw()
            })
        })
        .collect();

    let handles: HashSet<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(handles.len(), 2);
    // Contexts dropped with their threads.
    assert_eq!(device.live_handles(), 0);
}

#[test]
fn test_context_moves_to_worker_thread() {
    let device = backend(2);
    let mut ctx = ExecutionContext::with_backend(device.clone());
    ctx.set_device(DeviceId(1)).unwrap();

    let handle = thread::spawn(move || {
        let handle = ctx.linear_algebra_handle().unwrap();
        handle.device()
    })
    .join()
    .unwrap();

    assert_eq!(handle, DeviceId(1));
    assert_eq!(device.live_handles(), 0);
}

// ============================================================================
// DEVICE BINDING
// ============================================================================

#[test]
fn test_rebind_releases_old_handles() {
    let device = backend(2);
    let mut ctx = ExecutionContext::with_backend(device.clone());
    ctx.linear_algebra_handle().unwrap();
    ctx.rng_generator_handle().unwrap();
    assert_eq!(device.live_handles(), 2);

    ctx.set_device(DeviceId(1)).unwrap();
    assert_eq!(device.live_handles(), 0);
    assert!(ctx.rng_stream().device_generator().is_none());

    let gen = ctx.rng_generator_handle().unwrap();
    assert_eq!(gen.device(), DeviceId(1));
    assert_eq!(ctx.rng_stream().device_generator(), Some(gen));
}

#[test]
fn test_host_only_device_requests_fail_with_config_mismatch() {
    let mut ctx = ExecutionContext::host_only();
    for kind in [HandleKind::LinearAlgebra, HandleKind::RandomGeneration] {
        let err = ctx.handle(kind).unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigMismatch { .. }), "{:?}", err);
        assert_eq!(err.exit_code(), 120);
    }
    assert!(matches!(
        ctx.device_query(),
        Err(RuntimeError::ConfigMismatch { .. })
    ));
    // Host-side state still works.
    ctx.set_random_seed(9).unwrap();
    ctx.set_mode(ExecutionMode::DeviceAccelerated);
    assert_eq!(ctx.mode(), ExecutionMode::DeviceAccelerated);
}

#[cfg(not(feature = "cudnn"))]
#[test]
fn test_neural_net_handle_unsupported() {
    let mut ctx = ExecutionContext::with_backend(backend(1));
    let err = ctx.handle(HandleKind::NeuralNet).unwrap_err();
    assert!(matches!(err, RuntimeError::Unsupported { .. }));
    assert!(!err.is_allocation_failure());
    assert_eq!(err.exit_code(), 121);
}

#[test]
fn test_device_query_serializes() {
    let ctx = ExecutionContext::with_backend(backend(1));
    let props = ctx.device_query().unwrap();
    let json = serde_json::to_string(&props).unwrap();
    assert!(json.contains("Simulated Accelerator 0"));
}
