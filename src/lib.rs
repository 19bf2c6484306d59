//! GPU resource orchestration core for a browser-hosted LLM inference
//! engine.
//!
//! This crate sits directly above a WebGPU-class device and owns buffer
//! pooling, content-addressed uniform reuse, batched command recording, and
//! submission/completion discipline for a kernel pipeline that issues many
//! compute dispatches per generated token. It does not do model loading,
//! tokenization, kernel authoring, or CLI orchestration — those are
//! external collaborators that consume the types here.
//!
//! The owning model is single-threaded cooperative: one thread drives the
//! device, encodes passes, and polls for completion. There is no
//! synchronization primitive in this crate heavier than `RefCell`, which is
//! deliberate — see `device` module docs for the reasoning.

pub mod buffer_pool;
pub mod command_recorder;
pub mod device;
pub mod error;
pub mod hash;
pub mod partitioned_pool;
pub mod perf_guards;
pub mod profiler;
pub mod submission_tracker;
pub mod tensor;
pub mod uniform_cache;

pub use buffer_pool::{BufferHandle, BufferPool, BufferPoolConfig, BufferPoolStats};
pub use command_recorder::{CommandRecorder, CommandRecorderConfig, CommandRecorderStats};
pub use device::{AdapterInfo, Capabilities, DeviceContext, DeviceLimits, FeatureSet};
pub use error::{CoreError, Result};
pub use partitioned_pool::PartitionedBufferPool;
pub use perf_guards::{PerfGuards, PerfGuardsConfig};
pub use profiler::{GpuProfiler, ProfilerConfig, ProfilerResult};
pub use submission_tracker::{Phase, SubmissionTracker};
pub use tensor::{
    assert_dtype, assert_shape, create_cpu_weight_buffer, create_tensor, create_weight_buffer, dtype_bytes,
    get_buffer, get_layout, get_weight_dtype, infer_output_dtype, is_column_major, is_cpu_weight_buffer,
    is_weight_buffer, tensor_bytes, BufferLike, CpuWeightBuffer, Dtype, Layout, Tensor, WeightBuffer,
};
pub use uniform_cache::{UniformCache, UniformCacheConfig, UniformCacheStats};
