//! The module arena: values, ops, blocks and functions.
//!
//! Everything is addressed by index. Ops are created detached and placed into
//! blocks separately, which lets lowering code allocate new IR while deferring
//! every structural change to a [`crate::Rewrite`].

use dtensor_common::{LowerError, Mesh};
use serde::{Deserialize, Serialize};

use crate::ops::{Attribute, Attributes, BlockId, FuncId, OpData, OpId, OpKind, ValueId};
use crate::rewrite::InsertPoint;
use crate::symbol::SymbolTable;
use crate::types::{ElementType, TensorType};

/// Index of the device-id parameter of every per-device function.
pub const DEVICE_ID_ARG: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Private,
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArg { block: BlockId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueData {
    pub ty: TensorType,
    pub def: ValueDef,
}

/// Owner of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockParent {
    Function(FuncId),
    Op(OpId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    pub args: Vec<ValueId>,
    pub ops: Vec<OpId>,
    pub parent: BlockParent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub visibility: Visibility,
    /// Attributes of each parameter, parallel to the entry block arguments.
    pub arg_attrs: Vec<Attributes>,
    pub result_types: Vec<TensorType>,
    pub entry: BlockId,
    /// Created but not yet part of the module. Detached functions keep their
    /// symbol reserved but are skipped by [`Module::functions`] and
    /// [`Module::lookup_function`].
    #[serde(default)]
    pub detached: bool,
}

/// A whole program: the unit the lowering passes rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    values: Vec<ValueData>,
    ops: Vec<OpData>,
    blocks: Vec<BlockData>,
    functions: Vec<Function>,
    symbols: SymbolTable,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            ops: Vec::new(),
            blocks: Vec::new(),
            functions: Vec::new(),
            symbols: SymbolTable::new(),
        }
    }

    // ── Construction ─────────────────────────────────────────────────

    fn new_value(&mut self, ty: TensorType, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def });
        id
    }

    fn new_block(&mut self, parent: BlockParent) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            args: Vec::new(),
            ops: Vec::new(),
            parent,
        });
        id
    }

    /// Create a function with an empty entry block and register it in the
    /// symbol table. The registered name may differ from `name` when it
    /// collides with an existing symbol.
    pub fn add_function(
        &mut self,
        name: &str,
        arg_types: Vec<TensorType>,
        result_types: Vec<TensorType>,
        visibility: Visibility,
    ) -> FuncId {
        let id = self.create_function(name, arg_types, result_types, visibility);
        self.attach_function(id);
        id
    }

    /// Create a detached function. Its name is reserved in the symbol table
    /// right away so later functions cannot take it, but the function only
    /// becomes visible once [`Module::attach_function`] is called.
    pub fn create_function(
        &mut self,
        name: &str,
        arg_types: Vec<TensorType>,
        result_types: Vec<TensorType>,
        visibility: Visibility,
    ) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        let entry = self.new_block(BlockParent::Function(id));
        let num_args = arg_types.len();
        for (index, ty) in arg_types.into_iter().enumerate() {
            let arg = self.new_value(ty, ValueDef::BlockArg { block: entry, index });
            self.blocks[entry.0 as usize].args.push(arg);
        }
        let name = self.symbols.insert(name, id);
        self.functions.push(Function {
            name,
            visibility,
            arg_attrs: vec![Attributes::new(); num_args],
            result_types,
            entry,
            detached: true,
        });
        id
    }

    pub fn attach_function(&mut self, func: FuncId) {
        self.functions[func.0 as usize].detached = false;
    }

    /// Create a detached op. Cluster ops get one empty body block.
    pub fn create_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty, ValueDef::OpResult { op: id, index }))
            .collect();
        let regions = if matches!(kind, OpKind::Cluster { .. }) {
            vec![self.new_block(BlockParent::Op(id))]
        } else {
            Vec::new()
        };
        self.ops.push(OpData {
            kind,
            operands,
            results,
            attrs: Attributes::new(),
            regions,
            parent: None,
            erased: false,
        });
        id
    }

    /// Create an op and append it to `block`.
    pub fn push_op(
        &mut self,
        block: BlockId,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> OpId {
        let op = self.create_op(kind, operands, result_types);
        self.insert_op(InsertPoint::BlockEnd(block), op);
        op
    }

    /// Append a cluster running on `mesh` to `block`; returns the cluster and
    /// its body block.
    pub fn push_cluster(&mut self, block: BlockId, mesh: Option<Mesh>) -> (OpId, BlockId) {
        let op = self.push_op(block, OpKind::Cluster { mesh }, Vec::new(), Vec::new());
        (op, self.ops[op.0 as usize].regions[0])
    }

    // ── Structural mutation ──────────────────────────────────────────

    /// Place a detached op at `point`.
    ///
    /// # Panics
    ///
    /// Panics if the op is already placed or the anchor op is detached.
    pub fn insert_op(&mut self, point: InsertPoint, op: OpId) {
        assert!(
            self.op(op).parent.is_none(),
            "op {op:?} is already placed in a block"
        );
        let (block, index) = match point {
            InsertPoint::Before(anchor) => {
                let (block, pos) = self.position(anchor);
                (block, pos)
            }
            InsertPoint::After(anchor) => {
                let (block, pos) = self.position(anchor);
                (block, pos + 1)
            }
            InsertPoint::BlockStart(block) => (block, 0),
            InsertPoint::BlockEnd(block) => (block, self.block(block).ops.len()),
        };
        self.blocks[block.0 as usize].ops.insert(index, op);
        self.ops[op.0 as usize].parent = Some(block);
    }

    fn position(&self, op: OpId) -> (BlockId, usize) {
        let block = self
            .op(op)
            .parent
            .unwrap_or_else(|| panic!("anchor op {op:?} is not placed in a block"));
        let pos = self
            .block(block)
            .ops
            .iter()
            .position(|&o| o == op)
            .unwrap_or_else(|| panic!("op {op:?} missing from its parent block"));
        (block, pos)
    }

    /// Detach `op` from its block and mark it and everything nested in it as
    /// erased.
    pub fn erase_op(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.0 as usize].parent.take() {
            self.blocks[block.0 as usize].ops.retain(|&o| o != op);
        }
        let mut stack = vec![op];
        while let Some(current) = stack.pop() {
            self.ops[current.0 as usize].erased = true;
            for i in 0..self.ops[current.0 as usize].regions.len() {
                let region = self.ops[current.0 as usize].regions[i];
                stack.extend(self.blocks[region.0 as usize].ops.iter().copied());
            }
        }
    }

    /// Rewire every operand use of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for op in self.ops.iter_mut().filter(|op| !op.erased) {
            for operand in op.operands.iter_mut() {
                if *operand == old {
                    *operand = new;
                }
            }
        }
    }

    pub fn set_arg_attr(&mut self, func: FuncId, index: usize, name: &str, attr: Attribute) {
        self.functions[func.0 as usize].arg_attrs[index].insert(name.to_string(), attr);
    }

    pub fn set_op_attr(&mut self, op: OpId, name: &str, attr: Attribute) {
        self.ops[op.0 as usize].attrs.insert(name.to_string(), attr);
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn op(&self, id: OpId) -> &OpData {
        &self.ops[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.0 as usize]
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.0 as usize]
    }

    pub fn value_type(&self, id: ValueId) -> &TensorType {
        &self.values[id.0 as usize].ty
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    /// Attached functions, in creation order.
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FuncId(i as u32), f))
            .filter(|(_, f)| !f.detached)
    }

    pub fn lookup_function(&self, name: &str) -> Option<FuncId> {
        self.symbols
            .lookup(name)
            .filter(|&id| !self.function(id).detached)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Parameters of `func` (the entry block arguments).
    pub fn args(&self, func: FuncId) -> &[ValueId] {
        &self.block(self.function(func).entry).args
    }

    /// Result `index` of `op`.
    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.op(op).results[index]
    }

    /// The op defining `value`, or `None` for block arguments.
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.value(value).def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// The op owning the block `op` is placed in.
    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        let block = self.op(op).parent?;
        match self.block(block).parent {
            BlockParent::Op(parent) => Some(parent),
            BlockParent::Function(_) => None,
        }
    }

    /// The function `block` ultimately belongs to.
    pub fn block_function(&self, block: BlockId) -> Option<FuncId> {
        let mut current = block;
        loop {
            match self.block(current).parent {
                BlockParent::Function(func) => return Some(func),
                BlockParent::Op(op) => current = self.op(op).parent?,
            }
        }
    }

    /// The device-id value of a per-device function: its first parameter,
    /// which must be a `tensor<i32>` scalar.
    pub fn device_id(&self, func: FuncId) -> Result<ValueId, LowerError> {
        let function = self.function(func);
        let arg = self.args(func).get(DEVICE_ID_ARG).copied().ok_or_else(|| {
            LowerError::invalid_argument(format!(
                "function @{} has no device id argument",
                function.name
            ))
        })?;
        let ty = self.value_type(arg);
        if !ty.is_scalar() || ty.element != ElementType::I32 {
            return Err(LowerError::invalid_argument(format!(
                "device id argument of @{} must be tensor<i32>, found {ty}",
                function.name
            )));
        }
        Ok(arg)
    }

    /// Visit every op placed under `block`, pre-order, descending into
    /// regions.
    pub fn walk_block(&self, block: BlockId, f: &mut impl FnMut(OpId)) {
        for &op in &self.block(block).ops {
            f(op);
            for &region in &self.op(op).regions {
                self.walk_block(region, f);
            }
        }
    }

    /// All ops placed in `func`, pre-order.
    pub fn function_ops(&self, func: FuncId) -> Vec<OpId> {
        let mut ops = Vec::new();
        self.walk_block(self.function(func).entry, &mut |op| ops.push(op));
        ops
    }

    /// All ops currently placed somewhere in the module.
    pub fn live_ops(&self) -> impl Iterator<Item = (OpId, &OpData)> {
        self.ops
            .iter()
            .enumerate()
            .map(|(i, op)| (OpId(i as u32), op))
            .filter(|(_, op)| op.is_live())
    }

    /// Number of live ops matching `pred`.
    pub fn count_ops(&self, pred: impl Fn(&OpKind) -> bool) -> usize {
        self.live_ops().filter(|(_, op)| pred(&op.kind)).count()
    }

    /// Live ops that take `value` as an operand.
    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        self.live_ops()
            .filter(|(_, op)| op.operands.contains(&value))
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_scalar() -> TensorType {
        TensorType::scalar(ElementType::I32)
    }

    #[test]
    fn add_function_registers_unique_symbols() {
        let mut module = Module::new("m");
        let a = module.add_function("f", vec![i32_scalar()], vec![], Visibility::Public);
        let b = module.add_function("f", vec![], vec![], Visibility::Private);
        assert_eq!(module.function(a).name, "f");
        assert_eq!(module.function(b).name, "f_0");
        assert_eq!(module.lookup_function("f_0"), Some(b));
        assert_eq!(module.args(a).len(), 1);
    }

    #[test]
    fn detached_functions_reserve_names_until_attached() {
        let mut module = Module::new("m");
        let f = module.create_function("f", vec![], vec![], Visibility::Private);
        assert_eq!(module.lookup_function("f"), None);
        assert_eq!(module.functions().count(), 0);

        let g = module.add_function("f", vec![], vec![], Visibility::Public);
        assert_eq!(module.function(g).name, "f_0");

        module.attach_function(f);
        assert_eq!(module.lookup_function("f"), Some(f));
        assert_eq!(module.functions().map(|(id, _)| id).collect::<Vec<_>>(), vec![f, g]);
    }

    #[test]
    fn insert_before_and_after_keep_order() {
        let mut module = Module::new("m");
        let f = module.add_function("f", vec![i32_scalar()], vec![], Visibility::Public);
        let entry = module.function(f).entry;
        let ret = module.push_op(entry, OpKind::Return, vec![], vec![]);
        let a = module.create_op(OpKind::Add, vec![], vec![i32_scalar()]);
        let b = module.create_op(OpKind::Add, vec![], vec![i32_scalar()]);
        let c = module.create_op(OpKind::Add, vec![], vec![i32_scalar()]);
        module.insert_op(InsertPoint::Before(ret), a);
        module.insert_op(InsertPoint::After(a), c);
        module.insert_op(InsertPoint::BlockStart(entry), b);
        assert_eq!(module.block(entry).ops, vec![b, a, c, ret]);
    }

    #[test]
    fn erase_removes_nested_ops() {
        let mut module = Module::new("m");
        let f = module.add_function("f", vec![i32_scalar()], vec![], Visibility::Public);
        let entry = module.function(f).entry;
        let (cluster, body) = module.push_cluster(entry, None);
        let inner = module.push_op(body, OpKind::Return, vec![], vec![]);
        assert_eq!(module.parent_op(inner), Some(cluster));
        assert_eq!(module.block_function(body), Some(f));
        module.erase_op(cluster);
        assert!(module.op(inner).erased);
        assert!(module.block(entry).ops.is_empty());
        assert_eq!(module.live_ops().count(), 0);
    }

    #[test]
    fn replace_all_uses_rewires_operands() {
        let mut module = Module::new("m");
        let f = module.add_function("f", vec![i32_scalar()], vec![], Visibility::Public);
        let entry = module.function(f).entry;
        let x = module.args(f)[0];
        let a = module.push_op(entry, OpKind::Add, vec![x, x], vec![i32_scalar()]);
        let y = module.result(a, 0);
        let b = module.push_op(entry, OpKind::Add, vec![x, y], vec![i32_scalar()]);
        module.replace_all_uses(x, y);
        assert_eq!(module.op(b).operands, vec![y, y]);
        assert_eq!(module.users(y), vec![a, b]);
    }

    #[test]
    fn device_id_must_be_i32_scalar() {
        let mut module = Module::new("m");
        let good = module.add_function("good", vec![i32_scalar()], vec![], Visibility::Public);
        let none = module.add_function("none", vec![], vec![], Visibility::Public);
        let bad = module.add_function(
            "bad",
            vec![TensorType::new(ElementType::I32, [2])],
            vec![],
            Visibility::Public,
        );
        assert_eq!(module.device_id(good).unwrap(), module.args(good)[0]);
        assert_eq!(
            module.device_id(none).unwrap_err().message(),
            "function @none has no device id argument"
        );
        assert_eq!(
            module.device_id(bad).unwrap_err().message(),
            "device id argument of @bad must be tensor<i32>, found tensor<2xi32>"
        );
    }
}
