//! Bucketed buffer allocator with reuse, deferred destruction, and optional
//! leak detection.
//!
//! Buffers are destroyed eagerly only when it is provably safe (pool
//! teardown with no device, or immediate caller request via `clear_pool`).
//! Every other destruction path (over-capacity release, cache eviction)
//! enqueues into `deferred` and waits for an explicit
//! `flush_deferred_destruction` call, driven by whoever observed the
//! queue's submitted-work-complete signal (normally the Command Recorder).
//! This crate deliberately does not register a callback directly with
//! `wgpu::Queue::on_submitted_work_done`, since that closure must be `Send`
//! and every owner of a pool here is a single-threaded `Rc`/`RefCell` graph.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::device::DeviceContext;
use crate::error::{CoreError, Result};
use crate::perf_guards::with_perf_guards;
use crate::submission_tracker::with_submission_tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    pub alignment_bytes: u64,
    pub min_bucket_size_bytes: u64,
    pub large_buffer_threshold_bytes: u64,
    pub large_buffer_step_bytes: u64,
    pub max_buffers_per_bucket: usize,
    pub max_total_pooled_buffers: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            alignment_bytes: 256,
            min_bucket_size_bytes: 1024,
            large_buffer_threshold_bytes: 256 * 1024 * 1024,
            large_buffer_step_bytes: 64 * 1024 * 1024,
            max_buffers_per_bucket: 8,
            max_total_pooled_buffers: 256,
        }
    }
}

/// A handle to a pool-managed (or directly created) GPU buffer. Cheap to
/// clone; clones share the same underlying `wgpu::Buffer`. `id` is the
/// bookkeeping identity used by the pool's active-set map, since
/// `wgpu::Buffer` has no stable equality of its own.
#[derive(Clone)]
pub struct BufferHandle {
    id: u64,
    buffer: Rc<wgpu::Buffer>,
    size: u64,
    usage: wgpu::BufferUsages,
    label: Option<String>,
}

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    fn destroy(&self) {
        self.buffer.destroy();
    }
}

struct ActiveMeta {
    buffer: Rc<wgpu::Buffer>,
    size: u64,
    usage: wgpu::BufferUsages,
    label: Option<String>,
    acquired_at: Instant,
    #[cfg(feature = "leak-detection")]
    backtrace: Option<backtrace::Backtrace>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub total_bytes_allocated: u64,
    pub current_bytes_allocated: u64,
    pub peak_bytes_allocated: u64,
    pub active_count: usize,
    pub pooled_count: usize,
}

impl BufferPoolStats {
    pub fn hit_rate(&self) -> String {
        let total = self.allocations + self.reuses;
        if total == 0 {
            "0.0%".to_string()
        } else {
            format!("{:.1}%", (self.reuses as f64 / total as f64) * 100.0)
        }
    }
}

pub struct LeakInfo {
    pub id: u64,
    pub size: u64,
    pub label: Option<String>,
    pub age_ms: f64,
    #[cfg(feature = "leak-detection")]
    pub backtrace: Option<backtrace::Backtrace>,
}

fn bucket_key(usage: wgpu::BufferUsages, bucket: u64) -> (u32, u64) {
    (usage.bits(), bucket)
}

/// Pure bucket computation, independent of any live device: small requests
/// clamp to the floor, large ones step coarsely to avoid power-of-two
/// blow-ups near device maxima, everything in between rounds to the next
/// power of two. Falls back to the aligned size itself if the computed
/// bucket would exceed `device_max`, and only then fails if even that
/// exceeds the max.
pub fn compute_bucket(aligned: u64, config: &BufferPoolConfig, device_max: u64) -> Result<u64> {
    let bucket = if aligned <= config.min_bucket_size_bytes {
        config.min_bucket_size_bytes
    } else if aligned >= config.large_buffer_threshold_bytes {
        let stepped = div_ceil_u64(aligned, config.large_buffer_step_bytes) * config.large_buffer_step_bytes;
        if stepped > device_max {
            aligned
        } else {
            stepped
        }
    } else {
        let pow2 = next_power_of_two_u64(aligned);
        if pow2 > device_max {
            aligned
        } else {
            pow2
        }
    };

    if bucket > device_max {
        return Err(CoreError::BufferTooLarge {
            requested: bucket,
            max: device_max,
        });
    }
    Ok(bucket)
}

fn div_ceil_u64(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}

/// Next power of two without 32-bit overflow semantics; operates in u64
/// throughout since buffer sizes routinely exceed `u32::MAX`.
fn next_power_of_two_u64(value: u64) -> u64 {
    if value <= 1 {
        return 1;
    }
    let mut p = 1u64;
    while p < value {
        match p.checked_shl(1) {
            Some(next) => p = next,
            None => return value,
        }
    }
    p
}

fn align_up(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return size;
    }
    div_ceil_u64(size, alignment) * alignment
}

/// A bucketed allocator for storage/uniform/staging buffers, scoped to one
/// `DeviceContext`.
pub struct BufferPool {
    device_ctx: DeviceContext,
    config: BufferPoolConfig,
    pooling_enabled: bool,
    next_id: Cell<u64>,
    free: RefCell<HashMap<(u32, u64), Vec<BufferHandle>>>,
    active: RefCell<HashMap<u64, ActiveMeta>>,
    deferred: RefCell<Vec<BufferHandle>>,
    deferred_scheduled: Cell<bool>,
    stats: RefCell<BufferPoolStats>,
}

impl BufferPool {
    pub fn new(device_ctx: DeviceContext, config: BufferPoolConfig) -> Self {
        Self {
            device_ctx,
            config,
            pooling_enabled: true,
            next_id: Cell::new(1),
            free: RefCell::new(HashMap::new()),
            active: RefCell::new(HashMap::new()),
            deferred: RefCell::new(Vec::new()),
            deferred_scheduled: Cell::new(false),
            stats: RefCell::new(BufferPoolStats::default()),
        }
    }

    pub fn with_pooling_disabled(mut self) -> Self {
        self.pooling_enabled = false;
        self
    }

    fn device_max_for(&self, usage: wgpu::BufferUsages) -> Result<u64> {
        let limits = self.device_ctx.get_limits().ok_or(CoreError::NotInitialized)?;
        if usage.contains(wgpu::BufferUsages::STORAGE) {
            Ok(limits.max_storage_buffer_binding_size.min(limits.max_buffer_size))
        } else {
            Ok(limits.max_buffer_size)
        }
    }

    pub fn acquire(&self, size: u64, usage: wgpu::BufferUsages, label: Option<&str>) -> Result<BufferHandle> {
        let aligned = align_up(size, self.config.alignment_bytes);
        let device_max = self.device_max_for(usage)?;
        let bucket = compute_bucket(aligned, &self.config, device_max)?;

        let key = bucket_key(usage, bucket);
        if let Some(handle) = self.free.borrow_mut().get_mut(&key).and_then(Vec::pop) {
            self.stats.borrow_mut().reuses += 1;
            self.mark_active(&handle, label);
            return Ok(handle);
        }

        let device = self.device_ctx.device()?;
        let full_label = label.map(|l| format!("{l}_{bucket}"));
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: full_label.as_deref(),
            size: bucket,
            usage,
            mapped_at_creation: false,
        });

        let handle = BufferHandle {
            id: self.next_id.get(),
            buffer: Rc::new(buffer),
            size: bucket,
            usage,
            label: full_label,
        };
        self.next_id.set(self.next_id.get() + 1);

        {
            let mut stats = self.stats.borrow_mut();
            stats.allocations += 1;
            stats.total_bytes_allocated += bucket;
            stats.current_bytes_allocated += bucket;
            stats.peak_bytes_allocated = stats.peak_bytes_allocated.max(stats.current_bytes_allocated);
        }
        with_perf_guards(|guards| guards.note_allocation());
        self.mark_active(&handle, label);
        Ok(handle)
    }

    fn mark_active(&self, handle: &BufferHandle, label: Option<&str>) {
        self.active.borrow_mut().insert(
            handle.id,
            ActiveMeta {
                buffer: Rc::clone(&handle.buffer),
                size: handle.size,
                usage: handle.usage,
                label: label.map(str::to_string).or_else(|| handle.label.clone()),
                acquired_at: Instant::now(),
                #[cfg(feature = "leak-detection")]
                backtrace: Some(backtrace::Backtrace::new_unresolved()),
            },
        );
    }

    pub fn release(&self, handle: BufferHandle) {
        if self.active.borrow_mut().remove(&handle.id).is_none() {
            return;
        }

        if !self.pooling_enabled {
            self.schedule_deferred_destruction(handle);
            return;
        }

        let key = bucket_key(handle.usage, handle.size);
        let mut free = self.free.borrow_mut();
        let bucket_depth = free.get(&key).map(Vec::len).unwrap_or(0);
        let total_pooled: usize = free.values().map(Vec::len).sum();

        if bucket_depth < self.config.max_buffers_per_bucket && total_pooled < self.config.max_total_pooled_buffers {
            free.entry(key).or_default().push(handle);
        } else {
            drop(free);
            self.schedule_deferred_destruction(handle);
        }
    }

    fn schedule_deferred_destruction(&self, handle: BufferHandle) {
        {
            let mut stats = self.stats.borrow_mut();
            stats.current_bytes_allocated = stats.current_bytes_allocated.saturating_sub(handle.size);
        }
        if self.device_ctx.device().is_err() {
            handle.destroy();
            return;
        }
        self.deferred.borrow_mut().push(handle);
        self.deferred_scheduled.set(true);
    }

    /// Destroys every buffer currently enqueued for deferred destruction.
    /// Called once the owner has observed that all work referencing them
    /// has completed (e.g. from a Command Recorder's completion path).
    pub fn flush_deferred_destruction(&self) -> usize {
        let pending: Vec<BufferHandle> = self.deferred.borrow_mut().drain(..).collect();
        let count = pending.len();
        for handle in pending {
            handle.destroy();
        }
        self.deferred_scheduled.set(false);
        count
    }

    pub fn has_pending_destruction(&self) -> bool {
        self.deferred_scheduled.get()
    }

    pub fn create_staging_read(&self, size: u64) -> Result<BufferHandle> {
        self.acquire(
            size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            Some("staging_read"),
        )
    }

    pub fn create_upload(&self, size: u64) -> Result<BufferHandle> {
        self.acquire(
            size,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            Some("upload"),
        )
    }

    pub fn create_uniform(&self, size: u64) -> Result<BufferHandle> {
        let aligned = align_up(size, 256);
        self.acquire(
            aligned,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            Some("uniform"),
        )
    }

    pub fn upload(&self, handle: &BufferHandle, bytes: &[u8], offset: u64) -> Result<()> {
        let queue = self.device_ctx.queue()?;
        queue.write_buffer(&handle.buffer, offset, bytes);
        Ok(())
    }

    /// Reads `size` bytes back from `handle` (or its full size if `None`).
    /// Gated by Perf Guards; a non-strict denial yields an empty vector.
    pub fn read_buffer(&self, handle: &BufferHandle, size: Option<u64>) -> Result<Vec<u8>> {
        let allowed = with_perf_guards(|guards| guards.allow_readback())?;
        if !allowed {
            return Ok(Vec::new());
        }

        let read_size = size.unwrap_or(handle.size);
        let staging = self.create_staging_read(read_size)?;
        let device = self.device_ctx.device()?;
        let queue = self.device_ctx.queue()?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gpu-core read_buffer"),
        });
        encoder.copy_buffer_to_buffer(&handle.buffer, 0, &staging.buffer, 0, read_size);
        with_submission_tracker(|tracker| {
            tracker.time_submission(Some("read_buffer"), || queue.submit(Some(encoder.finish())));
        });

        let slice = staging.buffer.slice(..read_size);
        let result = Rc::new(RefCell::new(None));
        let result_clone = Rc::clone(&result);
        slice.map_async(wgpu::MapMode::Read, move |res| {
            *result_clone.borrow_mut() = Some(res);
        });
        device.poll(wgpu::Maintain::Wait);

        let map_result = result.borrow_mut().take();
        let data = match map_result {
            Some(Ok(())) => slice.get_mapped_range().to_vec(),
            _ => Vec::new(),
        };
        staging.buffer.unmap();
        self.release(staging);
        Ok(data)
    }

    /// Debug-only: active buffers whose age exceeds `threshold_ms`.
    pub fn detect_leaks(&self, threshold_ms: f64) -> Vec<LeakInfo> {
        self.active
            .borrow()
            .iter()
            .filter_map(|(&id, meta)| {
                let age_ms = meta.acquired_at.elapsed().as_secs_f64() * 1000.0;
                if age_ms > threshold_ms {
                    Some(LeakInfo {
                        id,
                        size: meta.size,
                        label: meta.label.clone(),
                        age_ms,
                        #[cfg(feature = "leak-detection")]
                        backtrace: meta.backtrace.clone(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn clear_pool(&self) {
        let mut free = self.free.borrow_mut();
        for (_, stack) in free.drain() {
            for handle in stack {
                handle.destroy();
            }
        }
    }

    pub fn destroy(&self) {
        self.clear_pool();
        for (_, meta) in self.active.borrow_mut().drain() {
            meta.buffer.destroy();
        }
        for handle in self.deferred.borrow_mut().drain(..) {
            handle.destroy();
        }
        self.deferred_scheduled.set(false);
    }

    pub fn get_stats(&self) -> BufferPoolStats {
        let mut stats = *self.stats.borrow();
        stats.active_count = self.active.borrow().len();
        stats.pooled_count = self.free.borrow().values().map(Vec::len).sum();
        stats
    }

    /// Scoped acquire: guarantees `release` runs on every exit path of `f`,
    /// including a failure returned by `f`.
    pub fn with_buffer<T>(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: Option<&str>,
        f: impl FnOnce(&BufferHandle) -> Result<T>,
    ) -> Result<T> {
        let handle = self.acquire(size, usage, label)?;
        let result = f(&handle);
        self.release(handle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BufferPoolConfig {
        BufferPoolConfig {
            alignment_bytes: 256,
            min_bucket_size_bytes: 1024,
            large_buffer_threshold_bytes: 256 * 1024 * 1024,
            large_buffer_step_bytes: 64 * 1024 * 1024,
            max_buffers_per_bucket: 8,
            max_total_pooled_buffers: 256,
        }
    }

    #[test]
    fn small_request_rounds_up_to_floor() {
        let bucket = compute_bucket(500, &config(), u64::MAX).unwrap();
        assert_eq!(bucket, 1024);
    }

    #[test]
    fn zero_size_rounds_to_floor() {
        let bucket = compute_bucket(0, &config(), u64::MAX).unwrap();
        assert_eq!(bucket, 1024);
    }

    #[test]
    fn mid_range_rounds_to_next_power_of_two() {
        let bucket = compute_bucket(3000, &config(), u64::MAX).unwrap();
        assert_eq!(bucket, 4096);
    }

    #[test]
    fn large_request_steps_coarsely_avoiding_power_of_two_blowup() {
        let cfg = config();
        let max = 2 * 1024 * 1024 * 1024 - 1;
        let bucket = compute_bucket(600 * 1024 * 1024, &cfg, max).unwrap();
        assert_eq!(bucket, 640 * 1024 * 1024);
    }

    #[test]
    fn bucket_equal_to_device_max_rounds_to_itself() {
        let cfg = config();
        let max = 10 * 1024 * 1024 * 1024u64;
        let bucket = compute_bucket(max, &cfg, max).unwrap();
        assert_eq!(bucket, max);
    }

    #[test]
    fn bucket_above_device_max_fails() {
        let cfg = config();
        let max = 1024u64;
        let err = compute_bucket(max + 1, &cfg, max).unwrap_err();
        assert!(matches!(err, CoreError::BufferTooLarge { .. }));
    }

    #[test]
    fn next_power_of_two_has_no_overflow_panic() {
        assert_eq!(next_power_of_two_u64(u64::MAX / 2), u64::MAX / 2 + 1);
    }
}
