//! Integration coverage for the seed scenarios that exercise a real device.
//! Runs natively via `pollster`; skipped (not failed) when no WebGPU-class
//! adapter is reachable in the environment running the tests, since CI
//! workers frequently have none.
#![cfg(not(target_arch = "wasm32"))]

use std::rc::Rc;

use gpu_core::buffer_pool::{BufferPool, BufferPoolConfig};
use gpu_core::command_recorder::{CommandRecorder, CommandRecorderConfig};
use gpu_core::device::DeviceContext;
use gpu_core::submission_tracker::with_submission_tracker;
use gpu_core::uniform_cache::{UniformCache, UniformCacheConfig};

fn test_device() -> Option<DeviceContext> {
    if !DeviceContext::is_available() {
        return None;
    }
    DeviceContext::init().ok()
}

macro_rules! require_device {
    () => {
        match test_device() {
            Some(ctx) => ctx,
            None => {
                eprintln!("skipping: no WebGPU-class adapter available in this environment");
                return;
            }
        }
    };
}

#[test]
fn pool_reuse_returns_the_same_bucket_on_release_and_reacquire() {
    let ctx = require_device!();
    let config = BufferPoolConfig {
        alignment_bytes: 256,
        min_bucket_size_bytes: 1024,
        ..BufferPoolConfig::default()
    };
    let pool = BufferPool::new(ctx, config);

    let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
    let first = pool.acquire(500, usage, Some("t")).expect("acquire 500");
    assert_eq!(first.size(), 1024);
    pool.release(first);

    let second = pool.acquire(800, usage, Some("t")).expect("acquire 800");
    assert_eq!(second.size(), 1024);

    let stats = pool.get_stats();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.reuses, 1);
    pool.release(second);
}

#[test]
fn large_storage_request_steps_coarsely_instead_of_doubling() {
    let ctx = require_device!();
    let limits = ctx.get_limits().expect("initialized context has limits");
    if limits.max_storage_buffer_binding_size < 700 * 1024 * 1024 {
        eprintln!("skipping: device storage binding limit too small for this scenario");
        return;
    }

    let config = BufferPoolConfig {
        large_buffer_threshold_bytes: 256 * 1024 * 1024,
        large_buffer_step_bytes: 64 * 1024 * 1024,
        ..BufferPoolConfig::default()
    };
    let pool = BufferPool::new(ctx, config);
    let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;

    let handle = pool.acquire(600 * 1024 * 1024, usage, Some("weights")).expect("acquire 600MiB");
    assert_eq!(handle.size(), 640 * 1024 * 1024);

    let stats = pool.get_stats();
    assert_eq!(stats.current_bytes_allocated, 640 * 1024 * 1024);
    pool.release(handle);
}

#[test]
fn uniform_cache_returns_identical_buffer_for_identical_bytes() {
    let ctx = require_device!();
    let cache = UniformCache::new(ctx, UniformCacheConfig::default());

    let a1 = cache.get_or_create(&[0, 1, 2, 3], "u").expect("first insert");
    let a2 = cache.get_or_create(&[0, 1, 2, 3], "u").expect("second lookup");
    assert!(Rc::ptr_eq(&a1, &a2));

    let b = cache.get_or_create(&[0, 1, 2, 4], "u").expect("distinct payload");
    assert!(!Rc::ptr_eq(&a1, &b));

    let stats = cache.get_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn uniform_cache_eviction_defers_destruction_until_flushed() {
    let ctx = require_device!();
    let cache = UniformCache::new(ctx, UniformCacheConfig { max_entries: 2, max_age_ms: 60_000 });

    cache.get_or_create(&[1], "a").unwrap();
    cache.get_or_create(&[2], "b").unwrap();
    // Third insert forces an LRU eviction since max_entries == 2.
    cache.get_or_create(&[3], "c").unwrap();

    let stats_before = cache.get_stats();
    assert_eq!(stats_before.evictions, 1);
    assert_eq!(stats_before.pending_destruction, 1);

    let flushed = cache.flush_pending_destruction();
    assert_eq!(flushed, 1);
    assert_eq!(cache.get_stats().pending_destruction, 0);
}

#[test]
fn recorder_batched_profiling_sums_to_roughly_the_total() {
    let ctx = require_device!();
    if !ctx.has_feature(gpu_core::device::FEATURE_TIMESTAMP_QUERY) {
        eprintln!("skipping: device has no timestamp-query feature");
        return;
    }

    with_submission_tracker(|tracker| {
        tracker.reset();
        tracker.set_enabled(true);
    });

    let cache = Rc::new(UniformCache::new(ctx.clone(), UniformCacheConfig::default()));
    let recorder = CommandRecorder::new(
        ctx,
        "batched-forward-pass",
        CommandRecorderConfig { profile: true, ..CommandRecorderConfig::default() },
        cache,
    )
    .expect("recorder with profiling");

    for i in 0..4 {
        let label = format!("kernel_{i}");
        recorder.begin_compute_pass(Some(&label), |_pass| {}).expect("pass encoded");
    }

    recorder.submit_and_wait().expect("submit_and_wait");
    let timings = recorder.resolve_profile_timings().expect("resolve timings");
    assert_eq!(timings.len(), 4);
    assert!(timings.values().all(|&ms| ms >= 0.0));

    // main submit + resolve-pass submit, both routed through the tracker.
    assert_eq!(with_submission_tracker(|tracker| tracker.global_stats().count), 2);
}

#[test]
fn mutating_the_recorder_after_submit_fails_with_after_submit() {
    let ctx = require_device!();
    let cache = Rc::new(UniformCache::new(ctx.clone(), UniformCacheConfig::default()));
    let recorder = CommandRecorder::new(ctx, "single-shot", CommandRecorderConfig::default(), cache).unwrap();

    recorder.submit().expect("first submit succeeds");
    let err = recorder
        .create_temp_buffer(256, wgpu::BufferUsages::STORAGE, Some("late"))
        .unwrap_err();
    assert!(matches!(err, gpu_core::error::CoreError::AfterSubmit));

    // abort() after submit is a documented no-op.
    recorder.abort();
}
