//! Positioned op builder.

use crate::module::Module;
use crate::ops::{Literal, OpId, OpKind, ValueId};
use crate::rewrite::{InsertPoint, Rewrite};
use crate::types::{ElementType, TensorType};

/// Creates ops in the module arena and records their placement in a
/// [`Rewrite`].
///
/// Successive emissions keep program order: after emitting at
/// `After(x)` or `BlockStart(b)`, the next op is placed after the one just
/// emitted.
pub struct Emitter<'a> {
    module: &'a mut Module,
    rewrite: &'a mut Rewrite,
    point: InsertPoint,
}

impl<'a> Emitter<'a> {
    pub fn new(module: &'a mut Module, rewrite: &'a mut Rewrite, point: InsertPoint) -> Self {
        Self {
            module,
            rewrite,
            point,
        }
    }

    pub fn module(&self) -> &Module {
        &*self.module
    }

    pub fn rewrite(&self) -> &Rewrite {
        &*self.rewrite
    }

    pub fn rewrite_mut(&mut self) -> &mut Rewrite {
        &mut *self.rewrite
    }

    pub fn point(&self) -> InsertPoint {
        self.point
    }

    pub fn set_point(&mut self, point: InsertPoint) {
        self.point = point;
    }

    /// A second emitter over the same module and rewrite, positioned at
    /// `point`. This emitter's own position is untouched.
    pub fn at(&mut self, point: InsertPoint) -> Emitter<'_> {
        Emitter {
            module: &mut *self.module,
            rewrite: &mut *self.rewrite,
            point,
        }
    }

    pub fn emit(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> OpId {
        let op = self.module.create_op(kind, operands, result_types);
        self.rewrite.insert(self.point, op);
        self.point = match self.point {
            InsertPoint::Before(anchor) => InsertPoint::Before(anchor),
            InsertPoint::After(_) | InsertPoint::BlockStart(_) => InsertPoint::After(op),
            InsertPoint::BlockEnd(block) => InsertPoint::BlockEnd(block),
        };
        op
    }

    /// Emit a single-result op and return its result.
    pub fn emit_value(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_type: TensorType,
    ) -> ValueId {
        let op = self.emit(kind, operands, vec![result_type]);
        self.module.result(op, 0)
    }

    /// Dense `i32` constant of the given shape.
    pub fn const_i32(&mut self, values: Vec<i32>, shape: Vec<i64>) -> ValueId {
        let ty = TensorType::new(ElementType::I32, shape);
        self.emit_value(OpKind::Const { value: Literal::I32(values) }, vec![], ty)
    }

    /// `i32` scalar constant.
    pub fn int_scalar(&mut self, value: i32) -> ValueId {
        self.const_i32(vec![value], vec![])
    }

    pub fn reshape(&mut self, value: ValueId, shape: Vec<i64>) -> ValueId {
        let ty = self.module.value_type(value).with_shape(shape);
        self.emit_value(OpKind::Reshape, vec![value], ty)
    }

    /// Cast `value` to `element`, keeping its shape.
    pub fn cast(&mut self, value: ValueId, element: ElementType) -> ValueId {
        let ty = self.module.value_type(value).with_element(element);
        self.emit_value(OpKind::Cast, vec![value], ty)
    }
}
