//! Tensor types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Bool,
    I32,
    I64,
    F32,
    F64,
    Str,
}

impl ElementType {
    /// Whether this is a signless integer of exactly `width` bits.
    pub fn is_integer(self, width: u32) -> bool {
        matches!(
            (self, width),
            (ElementType::I32, 32) | (ElementType::I64, 64)
        )
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementType::Bool => "i1",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::Str => "!str",
        };
        f.write_str(s)
    }
}

/// A ranked tensor type. A dimension of `-1` is dynamic; rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub element: ElementType,
    pub shape: Vec<i64>,
}

impl TensorType {
    pub fn new(element: ElementType, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            element,
            shape: shape.into(),
        }
    }

    pub fn scalar(element: ElementType) -> Self {
        Self::new(element, Vec::new())
    }

    /// The same shape with a different element type.
    pub fn with_element(&self, element: ElementType) -> Self {
        Self::new(element, self.shape.clone())
    }

    /// The same element type with a different shape.
    pub fn with_shape(&self, shape: impl Into<Vec<i64>>) -> Self {
        Self::new(self.element, shape)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Number of elements, or `None` when any dimension is dynamic.
    pub fn num_elements(&self) -> Option<i64> {
        if self.shape.iter().any(|&d| d < 0) {
            None
        } else {
            Some(self.shape.iter().product())
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tensor<")?;
        for dim in &self.shape {
            if *dim < 0 {
                f.write_str("?x")?;
            } else {
                write!(f, "{dim}x")?;
            }
        }
        write!(f, "{}>", self.element)
    }
}
