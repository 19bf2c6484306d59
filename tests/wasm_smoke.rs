//! Browser-side smoke tests using wasm-bindgen-test.
//!
//! Run with:
//!   RUSTFLAGS="--cfg gpu_core_wasm_test" wasm-pack test --headless --chrome
//!
//! Device-dependent scenarios live in `tests/gpu_integration.rs` and require
//! a real adapter; this file covers pure logic that must also behave
//! correctly when compiled for `wasm32-unknown-unknown`, without requiring
//! WebGPU support in the test runner itself.
#![cfg(all(target_arch = "wasm32", gpu_core_wasm_test))]

use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

use gpu_core::buffer_pool::{compute_bucket, BufferPoolConfig};
use gpu_core::hash::content_key;
use gpu_core::tensor::{dtype_bytes, tensor_bytes, Dtype};

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

#[wasm_bindgen_test]
fn bucket_computation_matches_native_behavior() {
    console_error_panic_hook::set_once();
    let bucket = compute_bucket(500, &config(), u64::MAX).unwrap();
    assert_eq!(bucket, 1024);
}

#[wasm_bindgen_test]
fn content_key_is_stable_across_targets() {
    assert_eq!(content_key(&[0, 1, 2, 3]), content_key(&[0, 1, 2, 3]));
    assert_ne!(content_key(&[0, 1, 2, 3]), content_key(&[0, 1, 2, 4]));
}

#[wasm_bindgen_test]
fn tensor_byte_accounting_matches_native_behavior() {
    assert_eq!(dtype_bytes(Dtype::Half), Some(2));
    assert_eq!(tensor_bytes(&[2, 3, 4], Dtype::Single), Some(2 * 3 * 4 * 4));
}
