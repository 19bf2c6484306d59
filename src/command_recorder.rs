//! Batches compute-pass encoding into a single submission per forward pass.
//!
//! Unifies the two forms the source system carries (with and without
//! pooled-buffer tracking) into the single form the specification settles
//! on: the recorder owns temp buffers outright and also tracks pooled
//! buffers acquired elsewhere, releasing each back to its pool on
//! completion.
//!
//! `begin_compute_pass` hands the caller a `&mut wgpu::ComputePass` through
//! a closure rather than returning the pass by value: a `ComputePass`
//! borrows the `CommandEncoder` it was created from, and the encoder here
//! lives behind a `RefCell`, so a borrowed return value would be
//! self-referential. The closure form keeps the same encode-dispatches-here
//! usage without unsafe lifetime extension.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use crate::buffer_pool::{BufferHandle, BufferPool};
use crate::device::DeviceContext;
use crate::error::{CoreError, Result};
use crate::perf_guards::with_perf_guards;
use crate::submission_tracker::with_submission_tracker;
use crate::uniform_cache::UniformCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Submitted,
    Cleaned,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandRecorderConfig {
    pub profile: bool,
    pub max_queries: u32,
    pub default_query_limit: u32,
}

impl Default for CommandRecorderConfig {
    fn default() -> Self {
        Self {
            profile: false,
            max_queries: 256,
            default_query_limit: 64,
        }
    }
}

struct ProfileEntry {
    label: String,
    start_index: u32,
    end_index: u32,
}

struct Profiling {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback_buffer: wgpu::Buffer,
    capacity: u32,
    next_index: Cell<u32>,
    entries: RefCell<Vec<ProfileEntry>>,
}

thread_local! {
    static LOGGED_QUERY_CLAMP: Cell<bool> = const { Cell::new(false) };
}

impl Profiling {
    fn try_provision(device_ctx: &DeviceContext, config: &CommandRecorderConfig) -> Option<Self> {
        if !config.profile || !device_ctx.has_feature(crate::device::FEATURE_TIMESTAMP_QUERY) {
            return None;
        }
        let device = device_ctx.device().ok()?;

        let capacity = config.max_queries.min(config.default_query_limit.max(2));
        if capacity < 2 {
            return None;
        }
        if capacity < config.max_queries {
            LOGGED_QUERY_CLAMP.with(|logged| {
                if !logged.get() {
                    log::info!(
                        "gpu-core: profiling query capacity clamped to {capacity} (requested {})",
                        config.max_queries
                    );
                    logged.set(true);
                }
            });
        }

        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("gpu-core profiling queries"),
            ty: wgpu::QueryType::Timestamp,
            count: capacity,
        });
        let byte_size = capacity as u64 * 8;
        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu-core profiling resolve"),
            size: byte_size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu-core profiling readback"),
            size: byte_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Some(Self {
            query_set,
            resolve_buffer,
            readback_buffer,
            capacity,
            next_index: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        })
    }

    fn reserve(&self, label: Option<&str>) -> Option<wgpu::ComputePassTimestampWrites<'_>> {
        let start = self.next_index.get();
        if start + 2 > self.capacity {
            return None;
        }
        self.next_index.set(start + 2);
        self.entries.borrow_mut().push(ProfileEntry {
            label: label.unwrap_or("unlabeled").to_string(),
            start_index: start,
            end_index: start + 1,
        });
        Some(wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(start),
            end_of_pass_write_index: Some(start + 1),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRecorderStats {
    pub operations: u64,
    pub temp_buffer_count: usize,
    pub pooled_buffer_count: usize,
    pub submitted: bool,
}

struct TrackedPooled {
    pool: Rc<BufferPool>,
    handle: BufferHandle,
}

pub struct CommandRecorder {
    device_ctx: DeviceContext,
    uniform_cache: Rc<UniformCache>,
    label: String,
    state: Cell<State>,
    encoder: RefCell<Option<wgpu::CommandEncoder>>,
    temp_buffers: RefCell<Vec<Rc<wgpu::Buffer>>>,
    pooled_buffers: RefCell<Vec<TrackedPooled>>,
    profiling: Option<Profiling>,
    op_count: Cell<u64>,
    submission_index: RefCell<Option<wgpu::SubmissionIndex>>,
    started_at: Instant,
}

impl CommandRecorder {
    pub fn new(
        device_ctx: DeviceContext,
        label: &str,
        config: CommandRecorderConfig,
        uniform_cache: Rc<UniformCache>,
    ) -> Result<Self> {
        let device = device_ctx.device()?;
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        let profiling = Profiling::try_provision(&device_ctx, &config);

        Ok(Self {
            device_ctx,
            uniform_cache,
            label: label.to_string(),
            state: Cell::new(State::Open),
            encoder: RefCell::new(Some(encoder)),
            temp_buffers: RefCell::new(Vec::new()),
            pooled_buffers: RefCell::new(Vec::new()),
            profiling,
            op_count: Cell::new(0),
            submission_index: RefCell::new(None),
            started_at: Instant::now(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.get() == State::Open {
            Ok(())
        } else {
            Err(CoreError::AfterSubmit)
        }
    }

    pub fn create_temp_buffer(&self, size: u64, usage: wgpu::BufferUsages, label: Option<&str>) -> Result<Rc<wgpu::Buffer>> {
        self.ensure_open()?;
        let device = self.device_ctx.device()?;
        let buffer = Rc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label,
            size,
            usage,
            mapped_at_creation: false,
        }));
        with_perf_guards(|guards| guards.note_allocation());
        self.temp_buffers.borrow_mut().push(Rc::clone(&buffer));
        Ok(buffer)
    }

    pub fn create_indirect_dispatch_buffer(&self, workgroups: [u32; 3], label: Option<&str>) -> Result<Rc<wgpu::Buffer>> {
        self.ensure_open()?;
        let buffer = self.create_temp_buffer(
            12,
            wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            label,
        )?;
        self.write_indirect_dispatch_buffer(&buffer, workgroups, 0)?;
        Ok(buffer)
    }

    pub fn write_indirect_dispatch_buffer(&self, buffer: &Rc<wgpu::Buffer>, workgroups: [u32; 3], offset: u64) -> Result<()> {
        self.ensure_open()?;
        let queue = self.device_ctx.queue()?;
        queue.write_buffer(buffer, offset, bytemuck::cast_slice(&workgroups));
        Ok(())
    }

    /// Delegates to the uniform cache. Not tracked for recorder-driven
    /// cleanup: the cache's lifetime is independent of any one recorder.
    pub fn create_uniform_buffer(&self, bytes: &[u8], label: &str) -> Result<Rc<wgpu::Buffer>> {
        self.ensure_open()?;
        self.uniform_cache.get_or_create(bytes, label)
    }

    /// Hands the caller a mutable compute pass via a closure, with
    /// timestamp writes bound automatically when profiling capacity
    /// remains; otherwise falls back to an untimed pass.
    pub fn begin_compute_pass<R>(&self, label: Option<&str>, f: impl FnOnce(&mut wgpu::ComputePass) -> R) -> Result<R> {
        self.ensure_open()?;
        let mut encoder_ref = self.encoder.borrow_mut();
        let encoder = encoder_ref.as_mut().expect("encoder present while Open");

        let timestamp_writes = self.profiling.as_ref().and_then(|p| p.reserve(label));

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label,
            timestamp_writes,
        });
        let result = f(&mut pass);
        drop(pass);
        self.op_count.set(self.op_count.get() + 1);
        Ok(result)
    }

    pub fn track_temporary_buffer(&self, pool: Rc<BufferPool>, handle: BufferHandle) -> Result<()> {
        self.ensure_open()?;
        self.pooled_buffers.borrow_mut().push(TrackedPooled { pool, handle });
        Ok(())
    }

    pub fn with_encoder<R>(&self, f: impl FnOnce(&mut wgpu::CommandEncoder) -> R) -> Result<R> {
        self.ensure_open()?;
        let mut encoder_ref = self.encoder.borrow_mut();
        let encoder = encoder_ref.as_mut().expect("encoder present while Open");
        Ok(f(encoder))
    }

    pub fn get_stats(&self) -> CommandRecorderStats {
        CommandRecorderStats {
            operations: self.op_count.get(),
            temp_buffer_count: self.temp_buffers.borrow().len(),
            pooled_buffer_count: self.pooled_buffers.borrow().len(),
            submitted: self.state.get() != State::Open,
        }
    }

    /// Destroys tracked temp buffers, releases tracked pooled buffers, and
    /// tears down profiling resources without ever submitting the encoder.
    /// A no-op once the recorder has already left Open.
    pub fn abort(&self) {
        if self.state.get() != State::Open {
            return;
        }
        self.cleanup_tracked_buffers();
        self.state.set(State::Submitted);
    }

    fn cleanup_tracked_buffers(&self) {
        for buffer in self.temp_buffers.borrow_mut().drain(..) {
            buffer.destroy();
        }
        for tracked in self.pooled_buffers.borrow_mut().drain(..) {
            tracked.pool.release(tracked.handle);
        }
    }

    /// Finishes and submits the encoder. Cleanup (temp destruction, pooled
    /// release, uniform-cache flush) happens when the caller later observes
    /// completion via `poll_cleanup` or `submit_and_wait`; see the module
    /// docs for why this crate does not register a callback directly with
    /// the device queue.
    pub fn submit(&self) -> Result<()> {
        if self.state.get() != State::Open {
            return Err(CoreError::AlreadySubmitted);
        }
        let encoder = self.encoder.borrow_mut().take().expect("encoder present while Open");
        let queue = self.device_ctx.queue()?;
        let label = self.label.clone();
        let index = with_submission_tracker(|tracker| {
            tracker.time_submission(Some(&label), || queue.submit(Some(encoder.finish())))
        });
        *self.submission_index.borrow_mut() = Some(index);
        self.state.set(State::Submitted);
        Ok(())
    }

    /// Returns true once the submission has completed and cleanup has run.
    /// Safe to call repeatedly; a completed recorder is left in `Cleaned`.
    pub fn poll_cleanup(&self) -> Result<bool> {
        if self.state.get() == State::Cleaned {
            return Ok(true);
        }
        if self.state.get() != State::Submitted {
            return Ok(false);
        }
        let device = self.device_ctx.device()?;
        let index = self.submission_index.borrow().clone();
        let maintain = match index {
            Some(idx) => wgpu::Maintain::WaitForSubmissionIndex(idx),
            None => wgpu::Maintain::Poll,
        };
        let result = device.poll(maintain);
        if matches!(result, wgpu::MaintainResult::SubmissionQueueEmpty) {
            self.run_completion_cleanup();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn run_completion_cleanup(&self) {
        self.cleanup_tracked_buffers();
        self.uniform_cache.flush_pending_destruction();
        self.state.set(State::Cleaned);
    }

    /// `submit` followed by a blocking wait for completion, then cleanup.
    pub fn submit_and_wait(&self) -> Result<()> {
        self.submit()?;
        let device = self.device_ctx.device()?;
        let index = self.submission_index.borrow().clone().expect("set by submit()");
        device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        self.run_completion_cleanup();
        Ok(())
    }

    /// Resolves recorded GPU timestamps into per-label millisecond totals.
    /// Only legal once the recorder has left Open. Entries whose computed
    /// duration is negative or exceeds 60s are discarded as spurious.
    pub fn resolve_profile_timings(&self) -> Result<std::collections::HashMap<String, f64>> {
        if self.state.get() == State::Open {
            return Err(CoreError::AfterSubmit);
        }
        let profiling = match &self.profiling {
            Some(p) => p,
            None => return Err(CoreError::MissingTimestampResources),
        };
        if profiling.entries.borrow().is_empty() {
            return Ok(std::collections::HashMap::new());
        }

        if self.state.get() == State::Submitted {
            self.poll_cleanup()?;
        }

        let allowed = with_perf_guards(|guards| guards.allow_readback())?;
        if !allowed {
            return Ok(std::collections::HashMap::new());
        }

        let device = self.device_ctx.device()?;
        let queue = self.device_ctx.queue()?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gpu-core profile resolve"),
        });
        let count = profiling.next_index.get();
        encoder.resolve_query_set(&profiling.query_set, 0..count, &profiling.resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(&profiling.resolve_buffer, 0, &profiling.readback_buffer, 0, count as u64 * 8);
        let resolve_source = format!("{}_resolve", self.label);
        with_submission_tracker(|tracker| {
            tracker.time_submission(Some(&resolve_source), || queue.submit(Some(encoder.finish())));
        });

        let slice = profiling.readback_buffer.slice(..(count as u64 * 8));
        let mapped = Rc::new(RefCell::new(None));
        let mapped_clone = Rc::clone(&mapped);
        slice.map_async(wgpu::MapMode::Read, move |res| {
            *mapped_clone.borrow_mut() = Some(res);
        });
        device.poll(wgpu::Maintain::Wait);

        let mut results: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        if matches!(mapped.borrow_mut().take(), Some(Ok(()))) {
            let raw = slice.get_mapped_range();
            let timestamps: &[u64] = bytemuck::cast_slice(&raw);
            let period_ns = queue.get_timestamp_period() as f64;

            for entry in profiling.entries.borrow().iter() {
                let start = timestamps.get(entry.start_index as usize).copied().unwrap_or(0);
                let end = timestamps.get(entry.end_index as usize).copied().unwrap_or(0);
                let duration_ms = (end as i128 - start as i128) as f64 * period_ns / 1_000_000.0;
                if duration_ms < 0.0 || duration_ms > 60_000.0 {
                    continue;
                }
                *results.entry(entry.label.clone()).or_insert(0.0) += duration_ms;
            }
            drop(raw);
            profiling.readback_buffer.unmap();
        }

        Ok(results)
    }

    /// Pure formatter: sorts entries descending by time and renders an
    /// aligned text table with each entry's percentage of the total.
    pub fn format_profile_report(timings: &std::collections::HashMap<String, f64>) -> String {
        let total: f64 = timings.values().sum();
        let mut rows: Vec<(&String, &f64)> = timings.iter().collect();
        rows.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut out = String::new();
        for (label, &ms) in rows {
            let pct = if total > 0.0 { ms / total * 100.0 } else { 0.0 };
            out.push_str(&format!("{label:<32} {ms:>10.3} ms  {pct:>5.1}%\n"));
        }
        out
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_profile_report_sorts_descending_by_duration() {
        let mut timings = std::collections::HashMap::new();
        timings.insert("small".to_string(), 1.0);
        timings.insert("large".to_string(), 9.0);
        let report = CommandRecorder::format_profile_report(&timings);
        let large_pos = report.find("large").unwrap();
        let small_pos = report.find("small").unwrap();
        assert!(large_pos < small_pos);
    }

    #[test]
    fn format_profile_report_of_empty_map_is_empty_string() {
        assert_eq!(CommandRecorder::format_profile_report(&std::collections::HashMap::new()), "");
    }
}
