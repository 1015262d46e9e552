//! Deferred structural edits.
//!
//! Lowering code never edits the op graph directly. It creates detached ops
//! and functions, then records their attachment, attribute edits, placements,
//! use replacements and erasures in a [`Rewrite`]. The caller applies it in
//! one step; dropping it leaves the visible module untouched. Tests can
//! assert on the record itself.

use serde::Serialize;

use crate::module::Module;
use crate::ops::{Attribute, BlockId, FuncId, OpId, ValueId};

/// Where to place an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InsertPoint {
    Before(OpId),
    After(OpId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
}

/// An ordered record of edits to apply to a [`Module`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rewrite {
    /// Detached functions to attach.
    pub functions: Vec<FuncId>,
    /// `(function, parameter index, name, value)`.
    pub arg_attrs: Vec<(FuncId, usize, String, Attribute)>,
    pub op_attrs: Vec<(OpId, String, Attribute)>,
    /// Detached ops to place, applied in order.
    pub insertions: Vec<(InsertPoint, OpId)>,
    /// `(old, new)`: every use of `old` becomes a use of `new`.
    pub replacements: Vec<(ValueId, ValueId)>,
    pub erasures: Vec<OpId>,
}

impl Rewrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, func: FuncId) {
        self.functions.push(func);
    }

    pub fn set_arg_attr(&mut self, func: FuncId, index: usize, name: &str, attr: Attribute) {
        self.arg_attrs.push((func, index, name.to_string(), attr));
    }

    pub fn set_op_attr(&mut self, op: OpId, name: &str, attr: Attribute) {
        self.op_attrs.push((op, name.to_string(), attr));
    }

    pub fn insert(&mut self, point: InsertPoint, op: OpId) {
        self.insertions.push((point, op));
    }

    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        self.replacements.push((old, new));
    }

    pub fn erase(&mut self, op: OpId) {
        self.erasures.push(op);
    }

    pub fn erases(&self, op: OpId) -> bool {
        self.erasures.contains(&op)
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
            && self.arg_attrs.is_empty()
            && self.op_attrs.is_empty()
            && self.insertions.is_empty()
            && self.replacements.is_empty()
            && self.erasures.is_empty()
    }

    /// Ops this rewrite places into the module, in placement order.
    pub fn inserted_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.insertions.iter().map(|(_, op)| *op)
    }

    /// Apply the record: function attachment and attribute edits first, then
    /// placements, then use replacements, then erasures.
    pub fn apply(self, module: &mut Module) {
        for func in self.functions {
            module.attach_function(func);
        }
        for (func, index, name, attr) in self.arg_attrs {
            module.set_arg_attr(func, index, &name, attr);
        }
        for (op, name, attr) in self.op_attrs {
            module.set_op_attr(op, &name, attr);
        }
        for (point, op) in self.insertions {
            module.insert_op(point, op);
        }
        for (old, new) in self.replacements {
            module.replace_all_uses(old, new);
        }
        for op in self.erasures {
            module.erase_op(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Visibility;
    use crate::ops::OpKind;
    use crate::types::{ElementType, TensorType};

    #[test]
    fn apply_places_then_rewires_then_erases() {
        let ty = TensorType::scalar(ElementType::I32);
        let mut module = Module::new("m");
        let f = module.add_function("f", vec![ty.clone()], vec![], Visibility::Public);
        let entry = module.function(f).entry;
        let x = module.args(f)[0];
        let old = module.push_op(entry, OpKind::Add, vec![x, x], vec![ty.clone()]);
        let old_value = module.result(old, 0);
        let user = module.push_op(entry, OpKind::Return, vec![old_value], vec![]);

        let new = module.create_op(OpKind::Add, vec![x, x], vec![ty]);
        let new_value = module.result(new, 0);
        let mut rewrite = Rewrite::new();
        rewrite.insert(InsertPoint::Before(old), new);
        rewrite.replace_all_uses(old_value, new_value);
        rewrite.erase(old);
        assert!(rewrite.erases(old));
        assert_eq!(rewrite.inserted_ops().collect::<Vec<_>>(), vec![new]);

        rewrite.apply(&mut module);
        assert_eq!(module.block(entry).ops, vec![new, user]);
        assert_eq!(module.op(user).operands, vec![new_value]);
        assert!(module.op(old).erased);
    }

    #[test]
    fn functions_and_attrs_wait_for_apply() {
        let ty = TensorType::scalar(ElementType::I32);
        let mut module = Module::new("m");
        let branch = module.create_function("branch", vec![ty], vec![], Visibility::Private);
        let entry = module.function(branch).entry;
        let ret = module.create_op(OpKind::Return, vec![], vec![]);

        let mut rewrite = Rewrite::new();
        rewrite.add_function(branch);
        rewrite.set_arg_attr(branch, 0, "placement", Attribute::Bool(true));
        rewrite.set_op_attr(ret, "tag", Attribute::Str("end".into()));
        rewrite.insert(InsertPoint::BlockEnd(entry), ret);
        assert!(!rewrite.is_empty());

        assert_eq!(module.lookup_function("branch"), None);
        assert!(module.function(branch).arg_attrs[0].is_empty());

        rewrite.apply(&mut module);
        assert_eq!(module.lookup_function("branch"), Some(branch));
        assert_eq!(
            module.function(branch).arg_attrs[0].get("placement"),
            Some(&Attribute::Bool(true))
        );
        assert_eq!(module.op(ret).attrs.get("tag"), Some(&Attribute::Str("end".into())));
        assert_eq!(module.block(entry).ops, vec![ret]);
    }
}
