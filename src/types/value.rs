//! Cell values and tensors carried by record batches

use crate::error::{Result, ServingError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::Bool => 1,
            ElementType::Float32 | ElementType::Int32 => 4,
            ElementType::Float64 | ElementType::Int64 => 8,
        }
    }

    /// ONNX spelling of the element type, as used in `tensor(<elem>)`
    pub fn onnx_name(&self) -> &'static str {
        match self {
            ElementType::Float32 => "float",
            ElementType::Float64 => "double",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Bool => "bool",
        }
    }

    /// Wire name, matching the serde spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Bool => "bool",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "float32" => Some(ElementType::Float32),
            "float64" => Some(ElementType::Float64),
            "int32" => Some(ElementType::Int32),
            "int64" => Some(ElementType::Int64),
            "bool" => Some(ElementType::Bool),
            _ => None,
        }
    }

    /// Whether the element type holds integers
    pub fn is_integer(&self) -> bool {
        matches!(self, ElementType::Int32 | ElementType::Int64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.onnx_name())
    }
}

/// Multi-dimensional numeric array stored as little-endian raw bytes.
///
/// Invariant: `data.len() == element_count(shape) * dtype.size_bytes()` and
/// every dimension is non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorParts")]
pub struct Tensor {
    dtype: ElementType,
    shape: Vec<i64>,
    data: Vec<u8>,
}

/// Unchecked wire form of a tensor, validated on the way in
#[derive(Deserialize)]
struct TensorParts {
    dtype: ElementType,
    shape: Vec<i64>,
    data: Vec<u8>,
}

impl TryFrom<TensorParts> for Tensor {
    type Error = ServingError;

    fn try_from(parts: TensorParts) -> Result<Self> {
        Tensor::new(parts.dtype, parts.shape, parts.data)
    }
}

impl Tensor {
    /// Create a tensor from raw little-endian bytes
    pub fn new(dtype: ElementType, shape: Vec<i64>, data: Vec<u8>) -> Result<Self> {
        let count = element_count(&shape)?;
        let expected = count * dtype.size_bytes();
        if data.len() != expected {
            return Err(ServingError::MalformedPayload(format!(
                "tensor of shape {:?} and type {} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(ElementType::Float32, shape, data)
    }

    pub fn from_f64(shape: Vec<i64>, values: &[f64]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(ElementType::Float64, shape, data)
    }

    pub fn from_i32(shape: Vec<i64>, values: &[i32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(ElementType::Int32, shape, data)
    }

    pub fn from_i64(shape: Vec<i64>, values: &[i64]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(ElementType::Int64, shape, data)
    }

    pub fn from_bool(shape: Vec<i64>, values: &[bool]) -> Result<Self> {
        let data = values.iter().map(|&v| v as u8).collect();
        Self::new(ElementType::Bool, shape, data)
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Raw little-endian element bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements widened to f64, whatever the stored type
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.dtype {
            ElementType::Float32 => self.chunks::<4>().map(|b| f32::from_le_bytes(b) as f64).collect(),
            ElementType::Float64 => self.chunks::<8>().map(f64::from_le_bytes).collect(),
            ElementType::Int32 => self.chunks::<4>().map(|b| i32::from_le_bytes(b) as f64).collect(),
            ElementType::Int64 => self.chunks::<8>().map(|b| i64::from_le_bytes(b) as f64).collect(),
            ElementType::Bool => self.data.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            ElementType::Float32 => self.chunks::<4>().map(f32::from_le_bytes).collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as f32).collect(),
        }
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        match self.dtype {
            ElementType::Int64 => self.chunks::<8>().map(i64::from_le_bytes).collect(),
            ElementType::Int32 => self.chunks::<4>().map(|b| i32::from_le_bytes(b) as i64).collect(),
            ElementType::Bool => self.data.iter().map(|&b| (b != 0) as i64).collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as i64).collect(),
        }
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        self.to_i64_vec().into_iter().map(|v| v as i32).collect()
    }

    pub fn to_bool_vec(&self) -> Vec<bool> {
        match self.dtype {
            ElementType::Bool => self.data.iter().map(|&b| b != 0).collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v != 0.0).collect(),
        }
    }

    /// Convert to another element type. Float to integer casts truncate.
    pub fn cast(&self, dtype: ElementType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let shape = self.shape.clone();
        let converted = match dtype {
            ElementType::Float32 => Tensor::from_f32(shape, &self.to_f32_vec()),
            ElementType::Float64 => Tensor::from_f64(shape, &self.to_f64_vec()),
            ElementType::Int32 => Tensor::from_i32(shape, &self.to_i32_vec()),
            ElementType::Int64 => Tensor::from_i64(shape, &self.to_i64_vec()),
            ElementType::Bool => Tensor::from_bool(shape, &self.to_bool_vec()),
        };
        // Same element count and a validated shape, so construction cannot fail.
        converted.unwrap_or_else(|_| self.clone())
    }

    /// Reinterpret the elements under a new shape with the same element count
    pub fn reshape(mut self, shape: Vec<i64>) -> Result<Self> {
        let count = element_count(&shape)?;
        if count != self.len() {
            return Err(ServingError::SchemaMismatch(format!(
                "cannot reshape {} elements of shape {:?} into {:?}",
                self.len(),
                self.shape,
                shape
            )));
        }
        self.shape = shape;
        Ok(self)
    }

    /// Index of the largest element, first one on ties
    pub fn argmax(&self) -> Option<usize> {
        let values = self.to_f64_vec();
        let mut best: Option<(usize, f64)> = None;
        for (i, v) in values.into_iter().enumerate() {
            match best {
                Some((_, b)) if v <= b => {}
                _ => best = Some((i, v)),
            }
        }
        best.map(|(i, _)| i)
    }

    fn chunks<const N: usize>(&self) -> impl Iterator<Item = [u8; N]> + '_ {
        self.data.chunks_exact(N).map(|c| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(c);
            buf
        })
    }
}

/// Number of elements described by a shape
pub fn element_count(shape: &[i64]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        if dim < 0 {
            return Err(ServingError::MalformedPayload(format!(
                "negative tensor dimension in shape {:?}",
                shape
            )));
        }
        acc.checked_mul(dim as usize).ok_or_else(|| {
            ServingError::MalformedPayload(format!("tensor shape {:?} is too large", shape))
        })
    })
}

/// A single cell of a record batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Tensor(Tensor),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of a scalar
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Human readable type tag used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Tensor(_) => "tensor",
        }
    }

    /// Equality with numeric tolerance; integers and floats compare by value
    pub fn approx_eq(&self, other: &Value, tolerance: f64) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => {
                a.shape() == b.shape()
                    && a.to_f64_vec()
                        .iter()
                        .zip(b.to_f64_vec().iter())
                        .all(|(x, y)| floats_close(*x, *y, tolerance))
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => floats_close(a, b, tolerance),
                    _ => false,
                }
            }
            _ => self == other,
        }
    }
}

fn floats_close(a: f64, b: f64, tolerance: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b || (a - b).abs() <= tolerance
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Value::Tensor(v)
    }
}
