use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::EncodingError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
    Bytes,
}

impl DType {
    /// Datatype name used by the open inference (V2) protocol.
    pub const fn v2_name(self) -> &'static str {
        match self {
            DType::F32 => "FP32",
            DType::F64 => "FP64",
            DType::I32 => "INT32",
            DType::I64 => "INT64",
            DType::Bool => "BOOL",
            DType::Bytes => "BYTES",
        }
    }

    pub fn from_v2_name(name: &str) -> Result<Self, EncodingError> {
        match name {
            "FP32" => Ok(DType::F32),
            "FP64" => Ok(DType::F64),
            "INT32" => Ok(DType::I32),
            "INT64" => Ok(DType::I64),
            "BOOL" => Ok(DType::Bool),
            "BYTES" => Ok(DType::Bytes),
            other => Err(EncodingError::UnsupportedDType(other.to_string())),
        }
    }

    /// Size of one element in bytes; `None` for variable-length strings.
    pub const fn element_size(self) -> Option<usize> {
        match self {
            DType::F32 | DType::I32 => Some(4),
            DType::F64 | DType::I64 => Some(8),
            DType::Bool => Some(1),
            DType::Bytes => None,
        }
    }
}

/// Flat, row-major tensor storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
    Bytes(Vec<String>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::Bool(_) => DType::Bool,
            TensorData::Bytes(_) => DType::Bytes,
        }
    }

    fn get_f64(&self, idx: usize) -> Option<f64> {
        match self {
            TensorData::F32(v) => v.get(idx).map(|x| *x as f64),
            TensorData::F64(v) => v.get(idx).copied(),
            TensorData::I32(v) => v.get(idx).map(|x| *x as f64),
            TensorData::I64(v) => v.get(idx).map(|x| *x as f64),
            TensorData::Bool(v) => v.get(idx).map(|x| if *x { 1.0 } else { 0.0 }),
            TensorData::Bytes(_) => None,
        }
    }

    fn to_json_values(&self) -> Vec<Value> {
        match self {
            TensorData::F32(v) => v.iter().map(|x| f32_to_json(*x)).collect(),
            TensorData::F64(v) => v
                .iter()
                .map(|x| Number::from_f64(*x).map_or(Value::Null, Value::Number))
                .collect(),
            TensorData::I32(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TensorData::I64(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TensorData::Bool(v) => v.iter().map(|x| Value::Bool(*x)).collect(),
            TensorData::Bytes(v) => v.iter().map(|x| Value::String(x.clone())).collect(),
        }
    }

    fn from_json_values(dtype: DType, name: &str, values: &[Value]) -> Result<Self, EncodingError> {
        let bad = |v: &Value| {
            EncodingError::Malformed(format!(
                "tensor '{name}': expected {} element, got {v}",
                dtype.v2_name()
            ))
        };
        Ok(match dtype {
            DType::F32 => TensorData::F32(
                values
                    .iter()
                    .map(|v| v.as_f64().map(|x| x as f32).ok_or_else(|| bad(v)))
                    .collect::<Result<_, _>>()?,
            ),
            DType::F64 => TensorData::F64(
                values
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(|| bad(v)))
                    .collect::<Result<_, _>>()?,
            ),
            DType::I32 => TensorData::I32(
                values
                    .iter()
                    .map(|v| {
                        v.as_i64()
                            .and_then(|x| i32::try_from(x).ok())
                            .ok_or_else(|| bad(v))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            DType::I64 => TensorData::I64(
                values
                    .iter()
                    .map(|v| v.as_i64().ok_or_else(|| bad(v)))
                    .collect::<Result<_, _>>()?,
            ),
            DType::Bool => TensorData::Bool(
                values
                    .iter()
                    .map(|v| v.as_bool().ok_or_else(|| bad(v)))
                    .collect::<Result<_, _>>()?,
            ),
            DType::Bytes => TensorData::Bytes(
                values
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).ok_or_else(|| bad(v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// A named, shaped tensor: the unit of payload exchanged with models.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorData,
}

/// Upper bound on the outer rows of a tensor with no elements.
pub const MAX_EMPTY_ROWS: usize = 1 << 16;

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self::new(name, shape, TensorData::F32(values))
    }

    pub fn from_f64(name: impl Into<String>, shape: Vec<usize>, values: Vec<f64>) -> Self {
        Self::new(name, shape, TensorData::F64(values))
    }

    pub fn from_i64(name: impl Into<String>, shape: Vec<usize>, values: Vec<i64>) -> Self {
        Self::new(name, shape, TensorData::I64(values))
    }

    /// A one-element string tensor, used for labels and tags.
    pub fn from_str_scalar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, vec![1], TensorData::Bytes(vec![value.into()]))
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Element count implied by the shape (1 for a scalar), `None` if it
    /// overflows `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// Check the data length against the shape and reject NaN/inf.
    ///
    /// Nesting materializes every row in front of the first zero dimension,
    /// so an empty tensor is capped at `MAX_EMPTY_ROWS` of them.
    pub fn validate(&self) -> Result<(), EncodingError> {
        let expected = self.num_elements().ok_or_else(|| {
            EncodingError::Malformed(format!(
                "shape {:?} of '{}' overflows the element count",
                self.shape, self.name
            ))
        })?;
        if expected == 0 {
            let outer = self
                .shape
                .iter()
                .take_while(|&&dim| dim != 0)
                .try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
            if outer.map_or(true, |rows| rows > MAX_EMPTY_ROWS) {
                return Err(EncodingError::Malformed(format!(
                    "empty tensor '{}' has unbacked shape {:?}",
                    self.name, self.shape
                )));
            }
        }
        if self.data.len() != expected {
            return Err(EncodingError::ShapeMismatch {
                name: self.name.clone(),
                shape: self.shape.clone(),
                expected,
                actual: self.data.len(),
            });
        }
        let finite = match &self.data {
            TensorData::F32(v) => v.iter().all(|x| x.is_finite()),
            TensorData::F64(v) => v.iter().all(|x| x.is_finite()),
            _ => true,
        };
        if !finite {
            return Err(EncodingError::NonFinite {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Numeric value at a multi-dimensional index (row-major).
    pub fn value_at(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0;
        for (i, dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            flat = flat * dim + i;
        }
        self.data.get_f64(flat)
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        (0..self.data.len()).map(|i| self.data.get_f64(i)).collect()
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            TensorData::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Compare shape and contents, allowing `tolerance` on numeric elements.
    ///
    /// Integer and float tensors compare by value, so an `I64` decoded from
    /// one protocol matches the `F32` the other protocol carried.
    pub fn approx_eq(&self, other: &Tensor, tolerance: f64) -> bool {
        if self.shape != other.shape {
            return false;
        }
        match (self.as_strings(), other.as_strings()) {
            (Some(a), Some(b)) => return a == b,
            (None, None) => {}
            _ => return false,
        }
        match (self.to_f64_vec(), other.to_f64_vec()) {
            (Some(a), Some(b)) => {
                a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| (x - y).abs() <= tolerance)
            }
            _ => false,
        }
    }

    /// Flat row-major JSON values.
    pub(crate) fn to_flat_json(&self) -> Vec<Value> {
        self.data.to_json_values()
    }

    pub(crate) fn from_flat_json(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        values: &[Value],
    ) -> Result<Self, EncodingError> {
        let name = name.into();
        let data = TensorData::from_json_values(dtype, &name, values)?;
        let tensor = Self::new(name, shape, data);
        tensor.validate()?;
        Ok(tensor)
    }

    /// Render as nested JSON arrays following the shape.
    pub fn to_ndarray(&self) -> Result<Value, EncodingError> {
        self.validate()?;
        let flat = self.to_flat_json();
        Ok(nest(&flat, &self.shape))
    }

    /// Parse nested JSON arrays, inferring shape and element type.
    ///
    /// Integers decode as `I64` and any fractional number promotes the
    /// whole tensor to `F64`.
    pub fn from_ndarray(name: impl Into<String>, value: &Value) -> Result<Self, EncodingError> {
        let name = name.into();
        let mut shape = Vec::new();
        let mut cursor = value;
        while let Value::Array(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }

        let mut leaves = Vec::new();
        flatten(value, &shape, 0, &mut leaves).map_err(|_| EncodingError::Ragged {
            name: name.clone(),
        })?;

        let dtype = infer_dtype(&leaves).ok_or_else(|| EncodingError::Ragged {
            name: name.clone(),
        })?;
        let values: Vec<Value> = leaves.into_iter().cloned().collect();
        Self::from_flat_json(name, shape, dtype, &values)
    }
}

fn f32_to_json(x: f32) -> Value {
    // Shortest f32 repr keeps 0.9f32 as 0.9 rather than 0.8999999761581421.
    x.to_string()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn nest(flat: &[Value], shape: &[usize]) -> Value {
    match shape.split_first() {
        None => flat.first().cloned().unwrap_or(Value::Null),
        Some((&dim, rest)) => {
            let chunk: usize = rest.iter().product();
            Value::Array(
                (0..dim)
                    .map(|i| nest(&flat[i * chunk..(i + 1) * chunk], rest))
                    .collect(),
            )
        }
    }
}

fn flatten<'a>(
    value: &'a Value,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<&'a Value>,
) -> Result<(), ()> {
    if depth == shape.len() {
        if value.is_array() || value.is_object() || value.is_null() {
            return Err(());
        }
        out.push(value);
        return Ok(());
    }
    match value {
        Value::Array(items) if items.len() == shape[depth] => {
            for item in items {
                flatten(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        _ => Err(()),
    }
}

fn infer_dtype(leaves: &[&Value]) -> Option<DType> {
    if leaves.is_empty() {
        return Some(DType::F64);
    }
    if leaves.iter().all(|v| v.is_boolean()) {
        return Some(DType::Bool);
    }
    if leaves.iter().all(|v| v.is_string()) {
        return Some(DType::Bytes);
    }
    if leaves.iter().all(|v| v.is_i64()) {
        return Some(DType::I64);
    }
    if leaves.iter().all(|v| v.is_number()) {
        return Some(DType::F64);
    }
    None
}
