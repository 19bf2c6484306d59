//! Value types pairing a GPU buffer with the dtype/shape/layout metadata
//! kernels need for type-safe binding, modelled as the sum type the design
//! notes call for rather than the source system's weakly-typed "raw buffer
//! or descriptor" call sites.

use std::rc::Rc;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Half,
    Single,
    BrainFloat,
    FourBitK,
    EightBit,
}

impl Dtype {
    /// Bytes per element for the two dtypes activations are allowed to use.
    /// Weight-only dtypes (quantized/brain-float) have no fixed per-element
    /// byte width exposed here; callers computing weight buffer sizes work
    /// from the buffer's own byte length instead.
    pub fn bytes(self) -> Option<u64> {
        match self {
            Dtype::Half => Some(2),
            Dtype::Single => Some(4),
            Dtype::BrainFloat | Dtype::FourBitK | Dtype::EightBit => None,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Dtype::Half => "half",
            Dtype::Single => "single",
            Dtype::BrainFloat => "brain-float",
            Dtype::FourBitK => "4-bit-k-block",
            Dtype::EightBit => "8-bit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColumnMajor,
}

/// An immutable activation descriptor: a buffer plus dtype and a frozen
/// shape. Only `half`/`single` are legal activation dtypes.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Rc<wgpu::Buffer>,
    dtype: Dtype,
    shape: Vec<i64>,
    label: Option<String>,
}

/// An immutable weight descriptor backed by a GPU buffer.
#[derive(Debug, Clone)]
pub struct WeightBuffer {
    buffer: Rc<wgpu::Buffer>,
    dtype: Dtype,
    layout: Layout,
    shape: Vec<i64>,
    label: Option<String>,
}

/// A weight too large, or too rarely used, to justify residency on the
/// device: a CPU-resident single-precision array standing in for it.
#[derive(Debug, Clone)]
pub struct CpuWeightBuffer {
    data: Rc<Vec<f32>>,
    shape: Vec<i64>,
    label: Option<String>,
}

/// The sum type the design notes ask for, so call sites that accept "raw
/// buffer or tensor or weight" are exhaustively matched rather than
/// stringly-typed.
#[derive(Debug, Clone)]
pub enum BufferLike {
    Raw(Rc<wgpu::Buffer>),
    Tensor(Tensor),
    Weight(WeightBuffer),
    CpuWeight(CpuWeightBuffer),
}

pub fn create_tensor(buffer: Rc<wgpu::Buffer>, dtype: Dtype, shape: Vec<i64>, label: Option<&str>) -> Tensor {
    Tensor {
        buffer,
        dtype,
        shape,
        label: label.map(str::to_string),
    }
}

pub fn create_weight_buffer(
    buffer: Rc<wgpu::Buffer>,
    dtype: Dtype,
    layout: Layout,
    shape: Vec<i64>,
    label: Option<&str>,
) -> WeightBuffer {
    WeightBuffer {
        buffer,
        dtype,
        layout,
        shape,
        label: label.map(str::to_string),
    }
}

pub fn create_cpu_weight_buffer(data: Vec<f32>, shape: Vec<i64>, label: Option<&str>) -> CpuWeightBuffer {
    CpuWeightBuffer {
        data: Rc::new(data),
        shape,
        label: label.map(str::to_string),
    }
}

impl Tensor {
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn buffer(&self) -> &Rc<wgpu::Buffer> {
        &self.buffer
    }
}

impl WeightBuffer {
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn buffer(&self) -> &Rc<wgpu::Buffer> {
        &self.buffer
    }
}

impl CpuWeightBuffer {
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }
}

pub fn assert_dtype(dtype: Dtype, expected: Dtype, op: &'static str) -> Result<()> {
    if dtype == expected {
        Ok(())
    } else {
        Err(CoreError::TypeMismatch {
            op,
            expected: expected.to_string(),
            found: dtype.to_string(),
        })
    }
}

/// Shape-checks `found` against `expected`, where `-1` in `expected` is a
/// wildcard matching any extent at that position.
pub fn assert_shape(found: &[i64], expected: &[i64], op: &'static str) -> Result<()> {
    let matches = found.len() == expected.len()
        && found
            .iter()
            .zip(expected.iter())
            .all(|(&f, &e)| e == -1 || f == e);

    if matches {
        Ok(())
    } else {
        Err(CoreError::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            found: found.iter().map(|&v| v as u32).collect(),
        })
    }
}

pub fn dtype_bytes(dtype: Dtype) -> Option<u64> {
    dtype.bytes()
}

pub fn tensor_bytes(shape: &[i64], dtype: Dtype) -> Option<u64> {
    let per_element = dtype.bytes()?;
    let elements: i64 = shape.iter().product();
    Some(elements as u64 * per_element)
}

/// Half iff both inputs are half, else single: the conservative promotion
/// rule for mixed-dtype binary kernels.
pub fn infer_output_dtype(a: Dtype, b: Dtype) -> Dtype {
    if a == Dtype::Half && b == Dtype::Half {
        Dtype::Half
    } else {
        Dtype::Single
    }
}

pub fn is_column_major(weight: &WeightBuffer) -> bool {
    weight.layout == Layout::ColumnMajor
}

pub fn is_weight_buffer(value: &BufferLike) -> bool {
    matches!(value, BufferLike::Weight(_))
}

pub fn is_cpu_weight_buffer(value: &BufferLike) -> bool {
    matches!(value, BufferLike::CpuWeight(_))
}

/// Erases the descriptor down to its raw buffer, for call sites that only
/// need a binding target. CPU weights have no GPU buffer to erase to.
pub fn get_buffer(value: &BufferLike) -> Option<&Rc<wgpu::Buffer>> {
    match value {
        BufferLike::Raw(buffer) => Some(buffer),
        BufferLike::Tensor(t) => Some(&t.buffer),
        BufferLike::Weight(w) => Some(&w.buffer),
        BufferLike::CpuWeight(_) => None,
    }
}

pub fn get_layout(value: &BufferLike) -> Option<Layout> {
    match value {
        BufferLike::Weight(w) => Some(w.layout),
        _ => None,
    }
}

pub fn get_weight_dtype(value: &BufferLike) -> Option<Dtype> {
    match value {
        BufferLike::Weight(w) => Some(w.dtype),
        BufferLike::Tensor(t) => Some(t.dtype),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_bytes_matches_known_widths() {
        assert_eq!(dtype_bytes(Dtype::Half), Some(2));
        assert_eq!(dtype_bytes(Dtype::Single), Some(4));
        assert_eq!(dtype_bytes(Dtype::BrainFloat), None);
    }

    #[test]
    fn tensor_bytes_is_shape_product_times_width() {
        assert_eq!(tensor_bytes(&[2, 3, 4], Dtype::Single), Some(2 * 3 * 4 * 4));
    }

    #[test]
    fn infer_output_dtype_promotes_to_single_unless_both_half() {
        assert_eq!(infer_output_dtype(Dtype::Half, Dtype::Half), Dtype::Half);
        assert_eq!(infer_output_dtype(Dtype::Half, Dtype::Single), Dtype::Single);
    }

    #[test]
    fn assert_shape_accepts_wildcard_dimension() {
        assert!(assert_shape(&[4, 128], &[-1, 128], "test_op").is_ok());
        assert!(assert_shape(&[4, 64], &[-1, 128], "test_op").is_err());
    }

    #[test]
    fn assert_dtype_mismatch_reports_type_mismatch() {
        let err = assert_dtype(Dtype::Half, Dtype::Single, "test_op").unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));
    }
}
