//! Program key lookup for host <-> accelerator transfers.

use dtensor_common::LowerError;
use dtensor_ir::{
    cluster_body, ElementType, Emitter, InsertPoint, OpKind, ScopeChain, TensorType, ValueId,
};
use tracing::debug;

/// Type of the program key produced by the placeholder.
pub fn compilation_key_type() -> TensorType {
    TensorType::new(ElementType::Str, [3])
}

/// The program-key value of the cluster enclosing `scope`.
///
/// Reuses a placeholder already present in the cluster body (or already
/// queued at its start by the emitter's rewrite); otherwise queues a new one
/// at the start of the body. A cluster therefore never gets more than one.
pub fn get_or_create_compilation_key(
    emitter: &mut Emitter<'_>,
    scope: &ScopeChain,
) -> Result<ValueId, LowerError> {
    let cluster = scope.cluster("op requiring a compilation key")?;
    let module = emitter.module();
    let body = cluster_body(module, cluster);

    let mut existing = None;
    module.walk_block(body, &mut |op| {
        if existing.is_none() && matches!(module.op(op).kind, OpKind::CompilationKeyPlaceholder) {
            existing = Some(module.result(op, 0));
        }
    });
    if existing.is_none() {
        existing = emitter
            .rewrite()
            .insertions
            .iter()
            .find(|(point, op)| {
                *point == InsertPoint::BlockStart(body)
                    && matches!(module.op(*op).kind, OpKind::CompilationKeyPlaceholder)
            })
            .map(|(_, op)| module.result(*op, 0));
    }
    if let Some(key) = existing {
        return Ok(key);
    }

    debug!(?cluster, "creating compilation key placeholder");
    let mut start = emitter.at(InsertPoint::BlockStart(body));
    Ok(start.emit_value(
        OpKind::CompilationKeyPlaceholder,
        Vec::new(),
        compilation_key_type(),
    ))
}
