//! Runtime dispatch over per-device-pair branches.
//!
//! When the sending and receiving meshes both span several devices, each
//! device has to talk to a different peer. We outline one private function
//! per (sender, receiver) pair and select between them with a `Case` keyed on
//! the device ordinal.

use std::hash::{Hash, Hasher};

use dtensor_common::LowerError;
use dtensor_ir::{
    Emitter, FuncId, InsertPoint, Module, OpId, OpKind, Rewrite, TensorType, ValueId, Visibility,
};
use rustc_hash::FxHasher;
use tracing::trace;

/// Branch name template for the sending side.
pub const SEND_BRANCH_TEMPLATE: &str = "{op}_send_{hash}_{index}";

/// Branch name template for the receiving side.
pub const RECV_BRANCH_TEMPLATE: &str = "{op}_receive_{hash}_{index}";

/// What a branch body callback gets to know about its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchContext {
    pub function: FuncId,
    /// The branch function's first parameter, if it has one.
    pub arg: Option<ValueId>,
    pub index: usize,
}

/// Stable hash of an op's printed form.
pub fn op_hash(module: &Module, op: OpId) -> u64 {
    let mut hasher = FxHasher::default();
    module.op_to_string(op).hash(&mut hasher);
    hasher.finish()
}

/// Expand `{op}`, `{hash}` and `{index}` in `template`.
pub fn branch_name(template: &str, op: &str, hash: u64, index: usize) -> String {
    template
        .replace("{op}", op)
        .replace("{hash}", &hash.to_string())
        .replace("{index}", &index.to_string())
}

/// Outline one private function per item of `inputs`.
///
/// Each function takes the operand types of `anchor` and returns
/// `result_types`. `body` fills it in through an emitter positioned at the
/// end of the entry block and returns an op whose results the branch
/// returns. Functions are created detached with their names reserved in the
/// symbol table, so the returned names are unique even when the same anchor
/// is lowered twice. Their attachment and bodies are queued in `rewrite`.
pub fn generate_branches<T, F>(
    module: &mut Module,
    rewrite: &mut Rewrite,
    anchor: OpId,
    result_types: &[TensorType],
    template: &str,
    inputs: impl IntoIterator<Item = T>,
    mut body: F,
) -> Result<Vec<String>, LowerError>
where
    F: FnMut(&mut Emitter<'_>, &BranchContext, &T) -> Result<OpId, LowerError>,
{
    let arg_types: Vec<TensorType> = module
        .op(anchor)
        .operands
        .iter()
        .map(|&v| module.value_type(v).clone())
        .collect();
    let mnemonic = module.op(anchor).kind.mnemonic();
    let hash = op_hash(module, anchor);

    let mut branches = Vec::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let requested = branch_name(template, mnemonic, hash, index);
        let function = module.create_function(
            &requested,
            arg_types.clone(),
            result_types.to_vec(),
            Visibility::Private,
        );
        let entry = module.function(function).entry;
        let context = BranchContext {
            function,
            arg: module.args(function).first().copied(),
            index,
        };

        rewrite.add_function(function);
        let mut emitter = Emitter::new(module, rewrite, InsertPoint::BlockEnd(entry));
        let op = body(&mut emitter, &context, &input)?;
        let results = emitter.module().op(op).results.clone();
        emitter.emit(OpKind::Return, results, Vec::new());

        let name = module.function(function).name.clone();
        trace!(branch = %name, index, "outlined dispatch branch");
        branches.push(name);
    }
    Ok(branches)
}

/// Emit a `Case` selecting among `branches` by `index`, forwarding `inputs`.
pub fn build_case(
    emitter: &mut Emitter<'_>,
    index: ValueId,
    inputs: &[ValueId],
    branches: Vec<String>,
    result_types: Vec<TensorType>,
) -> OpId {
    let mut operands = Vec::with_capacity(inputs.len() + 1);
    operands.push(index);
    operands.extend_from_slice(inputs);
    emitter.emit(
        OpKind::Case {
            branches,
            is_stateless: false,
        },
        operands,
        result_types,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtensor_ir::{ElementType, Literal};

    #[test]
    fn expands_every_placeholder() {
        assert_eq!(
            branch_name(SEND_BRANCH_TEMPLATE, "DTensorSend", 42, 3),
            "DTensorSend_send_42_3"
        );
        assert_eq!(
            branch_name(RECV_BRANCH_TEMPLATE, "DTensorRecv", 7, 0),
            "DTensorRecv_receive_7_0"
        );
    }

    #[test]
    fn branches_take_anchor_operands_and_return_body_results() {
        let ty = TensorType::scalar(ElementType::F32);
        let mut module = Module::new("m");
        let f = module.add_function("main", vec![ty.clone()], vec![], Visibility::Public);
        let entry = module.function(f).entry;
        let x = module.args(f)[0];
        let anchor = module.push_op(entry, OpKind::Add, vec![x, x], vec![ty.clone()]);

        let mut rewrite = Rewrite::new();
        let branches = generate_branches(
            &mut module,
            &mut rewrite,
            anchor,
            &[ty.clone()],
            "branch_{index}",
            [1.0f32, 2.0],
            |emitter, context, value| {
                let arg = context.arg.expect("anchor has operands");
                let c = emitter.emit_value(
                    OpKind::Const {
                        value: Literal::F32(vec![*value]),
                    },
                    vec![],
                    ty.clone(),
                );
                Ok(emitter.emit(OpKind::Add, vec![arg, c], vec![ty.clone()]))
            },
        )
        .unwrap();
        assert_eq!(module.lookup_function("branch_0"), None);
        assert_eq!(rewrite.functions.len(), 2);
        rewrite.apply(&mut module);

        assert_eq!(branches, vec!["branch_0", "branch_1"]);
        let b0 = module.lookup_function("branch_0").unwrap();
        let func = module.function(b0);
        assert_eq!(func.visibility, Visibility::Private);
        assert_eq!(func.result_types, vec![ty.clone()]);
        assert_eq!(module.args(b0).len(), 2);

        let ops = &module.block(func.entry).ops;
        assert_eq!(ops.len(), 3);
        let last = module.op(ops[2]);
        assert!(matches!(last.kind, OpKind::Return));
        assert_eq!(last.operands, module.op(ops[1]).results);
    }

    #[test]
    fn callback_errors_stop_generation() {
        let mut module = Module::new("m");
        let f = module.add_function("main", vec![], vec![], Visibility::Public);
        let entry = module.function(f).entry;
        let anchor = module.push_op(entry, OpKind::Return, vec![], vec![]);

        let mut rewrite = Rewrite::new();
        let mut calls = 0;
        let err = generate_branches(
            &mut module,
            &mut rewrite,
            anchor,
            &[],
            "b_{index}",
            0..3,
            |_, _, _| {
                calls += 1;
                Err(LowerError::invalid_argument("boom"))
            },
        )
        .unwrap_err();
        assert_eq!(err.message(), "boom");
        assert_eq!(calls, 1);
    }
}
