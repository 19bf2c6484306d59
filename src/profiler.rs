//! Labeled begin/end timing layered over GPU timestamp queries, with a CPU
//! wall-clock fallback when the device lacks the `timestamp-query` feature
//! or a measurement looks spurious.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::device::DeviceContext;
use crate::error::Result;
use crate::perf_guards::with_perf_guards;

#[derive(Debug, Clone, Copy)]
pub struct ProfilerConfig {
    pub query_capacity: u32,
    pub max_samples: usize,
    pub max_duration_ms: f64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            query_capacity: 128,
            max_samples: 256,
            max_duration_ms: 60_000.0,
        }
    }
}

#[derive(Default)]
struct LabelStats {
    samples: std::collections::VecDeque<f64>,
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    count: u64,
}

impl LabelStats {
    fn push(&mut self, duration_ms: f64, cap: usize) {
        if self.count == 0 {
            self.min_ms = duration_ms;
            self.max_ms = duration_ms;
        } else {
            self.min_ms = self.min_ms.min(duration_ms);
            self.max_ms = self.max_ms.max(duration_ms);
        }
        self.count += 1;
        self.sum_ms += duration_ms;
        self.samples.push_back(duration_ms);
        while self.samples.len() > cap {
            self.samples.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProfilerResult {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: u64,
    pub total_ms: f64,
}

struct PendingGpuBracket {
    label: String,
    start_index: u32,
    end_index: u32,
}

struct GpuResources {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback_buffer: wgpu::Buffer,
    capacity: u32,
}

/// Higher-level profiler: CPU brackets always work; GPU timestamp brackets
/// are opportunistic and fold into the same per-label rolling window.
pub struct GpuProfiler {
    device_ctx: DeviceContext,
    config: ProfilerConfig,
    cpu_brackets: RefCell<HashMap<String, Instant>>,
    /// Most recent completed CPU-bracket duration per label, retained as
    /// the fallback a spurious GPU timestamp pair substitutes in for.
    last_cpu_ms: RefCell<HashMap<String, f64>>,
    labels: RefCell<HashMap<String, LabelStats>>,
    gpu: Option<GpuResources>,
    next_query_index: RefCell<u32>,
    pending_gpu: RefCell<Vec<PendingGpuBracket>>,
}

impl GpuProfiler {
    pub fn new(device_ctx: DeviceContext, config: ProfilerConfig) -> Self {
        let gpu = Self::try_provision(&device_ctx, &config);
        Self {
            device_ctx,
            config,
            cpu_brackets: RefCell::new(HashMap::new()),
            last_cpu_ms: RefCell::new(HashMap::new()),
            labels: RefCell::new(HashMap::new()),
            gpu,
            next_query_index: RefCell::new(0),
            pending_gpu: RefCell::new(Vec::new()),
        }
    }

    fn try_provision(device_ctx: &DeviceContext, config: &ProfilerConfig) -> Option<GpuResources> {
        if !device_ctx.has_feature(crate::device::FEATURE_TIMESTAMP_QUERY) {
            return None;
        }
        let device = device_ctx.device().ok()?;
        let capacity = config.query_capacity.max(2);
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("gpu-core profiler queries"),
            ty: wgpu::QueryType::Timestamp,
            count: capacity,
        });
        let byte_size = capacity as u64 * 8;
        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu-core profiler resolve"),
            size: byte_size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu-core profiler readback"),
            size: byte_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Some(GpuResources {
            query_set,
            resolve_buffer,
            readback_buffer,
            capacity,
        })
    }

    /// Starts a CPU wall-clock bracket for `label`. A second `begin` for the
    /// same label before a matching `end` simply overwrites the start time.
    pub fn begin(&self, label: &str) {
        self.cpu_brackets.borrow_mut().insert(label.to_string(), Instant::now());
    }

    /// Closes the CPU bracket for `label` and records its duration. A no-op
    /// if `begin` was never called for this label.
    pub fn end(&self, label: &str) {
        let start = self.cpu_brackets.borrow_mut().remove(label);
        if let Some(start) = start {
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.last_cpu_ms.borrow_mut().insert(label.to_string(), duration_ms);
            self.record(label, duration_ms);
        }
    }

    fn record(&self, label: &str, duration_ms: f64) {
        if !(0.0..=self.config.max_duration_ms).contains(&duration_ms) {
            return;
        }
        self.push_sample(label, duration_ms);
    }

    fn push_sample(&self, label: &str, duration_ms: f64) {
        self.labels
            .borrow_mut()
            .entry(label.to_string())
            .or_default()
            .push(duration_ms, self.config.max_samples);
    }

    /// Records a GPU-derived duration. A measurement outside
    /// `[0, max_duration_ms]` signals a spurious timestamp pair, so it is
    /// not recorded as-is: the most recent CPU bracket for `label` is
    /// substituted in its place. If no CPU bracket has ever completed for
    /// this label, the measurement is dropped, matching the discard path
    /// for an unrecoverable CPU sample.
    fn record_gpu(&self, label: &str, duration_ms: f64) {
        if (0.0..=self.config.max_duration_ms).contains(&duration_ms) {
            self.push_sample(label, duration_ms);
            return;
        }
        if let Some(&cpu_ms) = self.last_cpu_ms.borrow().get(label) {
            self.push_sample(label, cpu_ms);
        }
    }

    /// Writes a GPU timestamp at a compute pass boundary. `is_end` selects
    /// which half of the (start, end) pair this write closes; the pair is
    /// matched by label the next time `resolve()` runs. Returns `None`
    /// (rather than failing) when the profiler has no GPU resources or has
    /// exhausted its query capacity, so callers can fall back silently.
    pub fn write_timestamp(&self, pass: &mut wgpu::ComputePass, label: &str, is_end: bool) -> Option<()> {
        let gpu = self.gpu.as_ref()?;
        let mut next = self.next_query_index.borrow_mut();
        if *next >= gpu.capacity {
            return None;
        }
        let index = *next;
        *next += 1;
        pass.write_timestamp(&gpu.query_set, index);

        if is_end {
            let mut pending = self.pending_gpu.borrow_mut();
            if let Some(open) = pending.iter_mut().rev().find(|p| p.label == label && p.end_index == u32::MAX) {
                open.end_index = index;
            }
        } else {
            self.pending_gpu.borrow_mut().push(PendingGpuBracket {
                label: label.to_string(),
                start_index: index,
                end_index: u32::MAX,
            });
        }
        Some(())
    }

    /// Drains pending GPU-timestamp brackets: submits a resolve/copy
    /// encoder, waits for completion, reads back nanosecond counters, and
    /// folds each bracket's duration into its label's rolling window. Any
    /// measurement outside `[0, max_duration_ms]` is dropped in favor of
    /// whatever CPU bracket already covers that label.
    pub fn resolve(&self) -> Result<()> {
        let gpu = match &self.gpu {
            Some(gpu) => gpu,
            None => return Ok(()),
        };
        let count = *self.next_query_index.borrow();
        if count == 0 {
            return Ok(());
        }

        let allowed = with_perf_guards(|guards| guards.allow_readback())?;
        if !allowed {
            self.pending_gpu.borrow_mut().clear();
            *self.next_query_index.borrow_mut() = 0;
            return Ok(());
        }

        let device = self.device_ctx.device()?;
        let queue = self.device_ctx.queue()?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gpu-core profiler resolve"),
        });
        encoder.resolve_query_set(&gpu.query_set, 0..count, &gpu.resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(&gpu.resolve_buffer, 0, &gpu.readback_buffer, 0, count as u64 * 8);
        queue.submit(Some(encoder.finish()));

        let slice = gpu.readback_buffer.slice(..(count as u64 * 8));
        let mapped = Rc::new(RefCell::new(None));
        let mapped_clone = Rc::clone(&mapped);
        slice.map_async(wgpu::MapMode::Read, move |res| {
            *mapped_clone.borrow_mut() = Some(res);
        });
        device.poll(wgpu::Maintain::Wait);

        if matches!(mapped.borrow_mut().take(), Some(Ok(()))) {
            let raw = slice.get_mapped_range();
            let timestamps: &[u64] = bytemuck::cast_slice(&raw);
            let period_ns = queue.get_timestamp_period() as f64;

            for bracket in self.pending_gpu.borrow_mut().drain(..) {
                if bracket.end_index == u32::MAX {
                    continue;
                }
                let start = timestamps.get(bracket.start_index as usize).copied().unwrap_or(0);
                let end = timestamps.get(bracket.end_index as usize).copied().unwrap_or(0);
                let duration_ms = (end as i128 - start as i128) as f64 * period_ns / 1_000_000.0;
                self.record_gpu(&bracket.label, duration_ms);
            }
            drop(raw);
            gpu.readback_buffer.unmap();
        } else {
            self.pending_gpu.borrow_mut().clear();
        }

        *self.next_query_index.borrow_mut() = 0;
        Ok(())
    }

    pub fn get_results(&self) -> HashMap<String, ProfilerResult> {
        self.labels
            .borrow()
            .iter()
            .map(|(label, stats)| {
                (
                    label.clone(),
                    ProfilerResult {
                        avg_ms: if stats.count == 0 { 0.0 } else { stats.sum_ms / stats.count as f64 },
                        min_ms: stats.min_ms,
                        max_ms: stats.max_ms,
                        count: stats.count,
                        total_ms: stats.sum_ms,
                    },
                )
            })
            .collect()
    }

    pub fn get_report(&self) -> String {
        let results = self.get_results();
        let mut rows: Vec<(&String, &ProfilerResult)> = results.iter().collect();
        rows.sort_by(|a, b| b.1.total_ms.partial_cmp(&a.1.total_ms).unwrap_or(std::cmp::Ordering::Equal));

        let mut out = String::new();
        for (label, r) in rows {
            out.push_str(&format!(
                "{label:<32} avg {:>8.3} ms  min {:>8.3}  max {:>8.3}  n {:>5}  total {:>10.3} ms\n",
                r.avg_ms, r.min_ms, r.max_ms, r.count, r.total_ms
            ));
        }
        out
    }

    pub fn reset(&self) {
        self.cpu_brackets.borrow_mut().clear();
        self.last_cpu_ms.borrow_mut().clear();
        self.labels.borrow_mut().clear();
        self.pending_gpu.borrow_mut().clear();
        *self.next_query_index.borrow_mut() = 0;
    }

    pub fn destroy(&self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_bracket_without_matching_begin_is_a_no_op() {
        let profiler = GpuProfiler {
            device_ctx: DeviceContext::new_uninit(),
            config: ProfilerConfig::default(),
            cpu_brackets: RefCell::new(HashMap::new()),
            last_cpu_ms: RefCell::new(HashMap::new()),
            labels: RefCell::new(HashMap::new()),
            gpu: None,
            next_query_index: RefCell::new(0),
            pending_gpu: RefCell::new(Vec::new()),
        };
        profiler.end("never-begun");
        assert!(profiler.get_results().is_empty());
    }

    #[test]
    fn cpu_bracket_records_a_sample() {
        let profiler = GpuProfiler {
            device_ctx: DeviceContext::new_uninit(),
            config: ProfilerConfig::default(),
            cpu_brackets: RefCell::new(HashMap::new()),
            last_cpu_ms: RefCell::new(HashMap::new()),
            labels: RefCell::new(HashMap::new()),
            gpu: None,
            next_query_index: RefCell::new(0),
            pending_gpu: RefCell::new(Vec::new()),
        };
        profiler.begin("region");
        profiler.end("region");
        let results = profiler.get_results();
        assert_eq!(results.get("region").unwrap().count, 1);
    }

    #[test]
    fn out_of_range_gpu_duration_substitutes_last_cpu_bracket() {
        let profiler = GpuProfiler {
            device_ctx: DeviceContext::new_uninit(),
            config: ProfilerConfig::default(),
            cpu_brackets: RefCell::new(HashMap::new()),
            last_cpu_ms: RefCell::new(HashMap::new()),
            labels: RefCell::new(HashMap::new()),
            gpu: None,
            next_query_index: RefCell::new(0),
            pending_gpu: RefCell::new(Vec::new()),
        };
        profiler.last_cpu_ms.borrow_mut().insert("kernel".to_string(), 4.5);

        // A negative duration, as a wraparound timestamp pair would produce.
        profiler.record_gpu("kernel", -1.0);

        let results = profiler.get_results();
        let kernel = results.get("kernel").unwrap();
        assert_eq!(kernel.count, 1);
        assert_eq!(kernel.avg_ms, 4.5);
    }

    #[test]
    fn out_of_range_gpu_duration_with_no_cpu_bracket_is_dropped() {
        let profiler = GpuProfiler {
            device_ctx: DeviceContext::new_uninit(),
            config: ProfilerConfig::default(),
            cpu_brackets: RefCell::new(HashMap::new()),
            last_cpu_ms: RefCell::new(HashMap::new()),
            labels: RefCell::new(HashMap::new()),
            gpu: None,
            next_query_index: RefCell::new(0),
            pending_gpu: RefCell::new(Vec::new()),
        };
        profiler.record_gpu("kernel", -1.0);
        assert!(profiler.get_results().get("kernel").is_none());
    }
}
