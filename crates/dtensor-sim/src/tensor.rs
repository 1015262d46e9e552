//! Dense host tensors.

use dtensor_ir::{ElementType, Literal, TensorType};

use crate::SimError;

/// Row-major element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self) -> ElementType {
        match self {
            TensorData::Bool(_) => ElementType::Bool,
            TensorData::I32(_) => ElementType::I32,
            TensorData::I64(_) => ElementType::I64,
            TensorData::F32(_) => ElementType::F32,
            TensorData::F64(_) => ElementType::F64,
            TensorData::Str(_) => ElementType::Str,
        }
    }

    /// Keep the elements at `indices`, in that order.
    fn gather(&self, indices: &[usize]) -> TensorData {
        fn pick<T: Clone>(v: &[T], indices: &[usize]) -> Vec<T> {
            indices.iter().map(|&i| v[i].clone()).collect()
        }
        match self {
            TensorData::Bool(v) => TensorData::Bool(pick(v, indices)),
            TensorData::I32(v) => TensorData::I32(pick(v, indices)),
            TensorData::I64(v) => TensorData::I64(pick(v, indices)),
            TensorData::F32(v) => TensorData::F32(pick(v, indices)),
            TensorData::F64(v) => TensorData::F64(pick(v, indices)),
            TensorData::Str(v) => TensorData::Str(pick(v, indices)),
        }
    }

    fn to_f64s(&self) -> Option<Vec<f64>> {
        Some(match self {
            TensorData::Bool(v) => v.iter().map(|&b| b as i64 as f64).collect(),
            TensorData::I32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorData::I64(v) => v.iter().map(|&x| x as f64).collect(),
            TensorData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorData::F64(v) => v.clone(),
            TensorData::Str(_) => return None,
        })
    }

    fn to_i64s(&self) -> Option<Vec<i64>> {
        Some(match self {
            TensorData::Bool(v) => v.iter().map(|&b| b as i64).collect(),
            TensorData::I32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::I64(v) => v.clone(),
            TensorData::F32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::F64(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::Str(_) => return None,
        })
    }
}

/// A tensor value with a static shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape`.
    pub fn new(shape: Vec<i64>, data: TensorData) -> Result<Self, SimError> {
        let expected = shape.iter().product::<i64>();
        if shape.iter().any(|&d| d < 0) || expected != data.len() as i64 {
            return Err(SimError::Type(format!(
                "{} elements do not fill shape {shape:?}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn i32s(shape: Vec<i64>, values: Vec<i32>) -> Result<Self, SimError> {
        Self::new(shape, TensorData::I32(values))
    }

    pub fn scalar_i32(value: i32) -> Self {
        Self {
            shape: Vec::new(),
            data: TensorData::I32(vec![value]),
        }
    }

    pub fn f32s(shape: Vec<i64>, values: Vec<f32>) -> Result<Self, SimError> {
        Self::new(shape, TensorData::F32(values))
    }

    /// Materialize a constant of type `ty`. A single-element literal is
    /// broadcast to the whole shape.
    pub fn from_literal(literal: &Literal, ty: &TensorType) -> Result<Self, SimError> {
        let data = match literal {
            Literal::Bool(v) => TensorData::Bool(v.clone()),
            Literal::I32(v) => TensorData::I32(v.clone()),
            Literal::I64(v) => TensorData::I64(v.clone()),
            Literal::F32(v) => TensorData::F32(v.clone()),
        };
        let count = ty.num_elements().unwrap_or(-1);
        let data = if data.len() == 1 && count > 1 {
            data.gather(&vec![0; count as usize])
        } else {
            data
        };
        Self::new(ty.shape.clone(), data)?.cast(ty.element)
    }

    pub fn element(&self) -> ElementType {
        self.data.element()
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.element(), self.shape.clone())
    }

    /// Element values widened to `i64`; fails for non-numeric tensors.
    pub fn to_i64s(&self) -> Result<Vec<i64>, SimError> {
        self.data.to_i64s().ok_or_else(|| {
            SimError::Type(format!("expected a numeric tensor, got {}", self.ty()))
        })
    }

    /// The single value of a one-element integer tensor.
    pub fn as_index(&self) -> Result<i64, SimError> {
        let values = self.to_i64s()?;
        match values[..] {
            [value] => Ok(value),
            _ => Err(SimError::Type(format!(
                "expected a one-element tensor, got {}",
                self.ty()
            ))),
        }
    }

    /// Convert elements to `element`. Integer narrowing wraps.
    pub fn cast(&self, element: ElementType) -> Result<Tensor, SimError> {
        if element == self.element() {
            return Ok(self.clone());
        }
        let unsupported = || SimError::Type(format!("cannot cast {} to {element}", self.ty()));
        let ints = || self.data.to_i64s().ok_or_else(unsupported);
        let floats = || self.data.to_f64s().ok_or_else(unsupported);
        let data = match element {
            ElementType::Bool => TensorData::Bool(ints()?.iter().map(|&x| x != 0).collect()),
            ElementType::I32 => TensorData::I32(ints()?.iter().map(|&x| x as i32).collect()),
            ElementType::I64 => TensorData::I64(ints()?),
            ElementType::F32 => TensorData::F32(floats()?.iter().map(|&x| x as f32).collect()),
            ElementType::F64 => TensorData::F64(floats()?),
            ElementType::Str => return Err(unsupported()),
        };
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    pub fn reshape(&self, shape: Vec<i64>) -> Result<Tensor, SimError> {
        Tensor::new(shape, self.data.clone())
    }

    /// The block starting at `begin` with extent `size` along each dimension.
    pub fn slice(&self, begin: &[i64], size: &[i64]) -> Result<Tensor, SimError> {
        let rank = self.shape.len();
        if begin.len() != rank || size.len() != rank {
            return Err(SimError::Type(format!(
                "slice of rank-{rank} tensor needs {rank} offsets and sizes"
            )));
        }
        for d in 0..rank {
            if begin[d] < 0 || size[d] < 0 || begin[d] + size[d] > self.shape[d] {
                return Err(SimError::Type(format!(
                    "slice [{}, {}) is out of bounds for dimension {d} of size {}",
                    begin[d],
                    begin[d] + size[d],
                    self.shape[d]
                )));
            }
        }

        let mut strides = vec![1i64; rank];
        for d in (0..rank.saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.shape[d + 1];
        }
        let count: i64 = size.iter().product();
        let mut indices = Vec::with_capacity(count as usize);
        let mut position = vec![0i64; rank];
        for _ in 0..count {
            let flat: i64 = (0..rank).map(|d| (begin[d] + position[d]) * strides[d]).sum();
            indices.push(flat as usize);
            for d in (0..rank).rev() {
                position[d] += 1;
                if position[d] < size[d] {
                    break;
                }
                position[d] = 0;
            }
        }
        Tensor::new(size.to_vec(), self.data.gather(&indices))
    }

    /// Elementwise sum of two tensors of the same type.
    pub fn add(&self, other: &Tensor) -> Result<Tensor, SimError> {
        if self.ty() != other.ty() {
            return Err(SimError::Type(format!(
                "cannot add {} and {}",
                self.ty(),
                other.ty()
            )));
        }
        fn zip<T: Copy>(a: &[T], b: &[T], f: impl Fn(T, T) -> T) -> Vec<T> {
            a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
        }
        let data = match (&self.data, &other.data) {
            (TensorData::I32(a), TensorData::I32(b)) => {
                TensorData::I32(zip(a, b, i32::wrapping_add))
            }
            (TensorData::I64(a), TensorData::I64(b)) => {
                TensorData::I64(zip(a, b, i64::wrapping_add))
            }
            (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(zip(a, b, |x, y| x + y)),
            (TensorData::F64(a), TensorData::F64(b)) => TensorData::F64(zip(a, b, |x, y| x + y)),
            _ => return Err(SimError::Type(format!("cannot add {} values", self.element()))),
        };
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }
}
