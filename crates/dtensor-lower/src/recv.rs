//! Lowering of the receiving side of a transfer.
//!
//! Each entry point replaces every use of the abstract receive's result with
//! the value produced by the new primitive (or dispatch construct) and erases
//! the abstract op.

use dtensor_common::{Layout, LowerError, Mesh};
use dtensor_ir::{
    cluster_body, cluster_mesh, Attribute, ElementType, Emitter, InsertPoint, Module, OpId,
    OpKind, Rewrite, ScopeChain, TensorType, ValueId, LAYOUT_ATTR,
};
use tracing::debug;

use crate::compile_key::get_or_create_compilation_key;
use crate::dispatch::{build_case, generate_branches, RECV_BRANCH_TEMPLATE};
use crate::ordinal::{device_ordinal, OrdinalWidth};
use crate::{first_local_device, Lowered};

const WHAT: &str = "DTensorRecv";

struct RecvParts {
    key: String,
    layout: Layout,
    result: ValueId,
    ty: TensorType,
}

fn recv_parts(module: &Module, recv: OpId) -> Result<RecvParts, LowerError> {
    let data = module.op(recv);
    let OpKind::DTensorRecv { key, layout } = &data.kind else {
        return Err(LowerError::invalid_argument(format!(
            "expected tf.DTensorRecv, found {}",
            data.kind.name()
        )));
    };
    let [result] = data.results[..] else {
        return Err(LowerError::invalid_argument(format!(
            "DTensorRecv '{key}' must have exactly one result, found {}",
            data.results.len()
        )));
    };
    Ok(RecvParts {
        key: key.clone(),
        layout: layout.clone(),
        result,
        ty: module.value_type(result).clone(),
    })
}

fn host_recv(key: &str, send_device: &str, recv_device: &str) -> OpKind {
    OpKind::HostRecv {
        key: key.to_string(),
        send_device: send_device.to_string(),
        send_device_incarnation: 0,
        recv_device: recv_device.to_string(),
        client_terminated: false,
    }
}

/// Finish a lowering whose replacement value is `value`.
fn replace_and_erase(
    mut rewrite: Rewrite,
    recv: OpId,
    old: ValueId,
    op: OpId,
    value: ValueId,
) -> Lowered {
    rewrite.replace_all_uses(old, value);
    rewrite.erase(recv);
    Lowered {
        op,
        result: Some(value),
        rewrite,
    }
}

/// Declared result type of the abstract receive `recv`.
pub fn declared_type(module: &Module, recv: OpId) -> Result<TensorType, LowerError> {
    recv_parts(module, recv).map(|parts| parts.ty)
}

/// Lower to a single host receive of `output_type`, from the first device of
/// `send_mesh` to the first device of the receive's mesh.
pub fn lower_recv_to_host_recv(
    module: &mut Module,
    recv: OpId,
    send_mesh: &Mesh,
    output_type: TensorType,
) -> Result<Lowered, LowerError> {
    let parts = recv_parts(module, recv)?;
    let from = first_local_device(send_mesh, "sending")?.to_string();
    let to = first_local_device(parts.layout.mesh(), "receiving")?.to_string();
    debug!(key = %parts.key, %from, %to, "lowering recv to host recv");

    let mut rewrite = Rewrite::new();
    let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::Before(recv));
    let op = emitter.emit(host_recv(&parts.key, &from, &to), Vec::new(), vec![output_type]);
    let value = emitter.module().result(op, 0);
    Ok(replace_and_erase(rewrite, recv, parts.result, op, value))
}

/// Lower to an accelerator-aware receive of the declared result type.
pub fn lower_recv_to_xla(
    module: &mut Module,
    scope: &ScopeChain,
    recv: OpId,
) -> Result<Lowered, LowerError> {
    let ty = declared_type(module, recv)?;
    lower_recv_to_xla_with_type(module, scope, recv, ty)
}

/// Lower to an accelerator-aware receive producing `output_type`.
///
/// On a host mesh this is a receive-at-host fed by the cluster's program key
/// and the executing device's ordinal on the cluster's mesh; both are
/// computed at the start of the cluster body. Otherwise it is a
/// receive-from-host carrying the declared shape.
pub fn lower_recv_to_xla_with_type(
    module: &mut Module,
    scope: &ScopeChain,
    recv: OpId,
    output_type: TensorType,
) -> Result<Lowered, LowerError> {
    let parts = recv_parts(module, recv)?;
    let mut rewrite = Rewrite::new();

    let op = if parts.layout.mesh().is_cpu_mesh() {
        let cluster = scope.cluster(WHAT)?;
        let mesh = cluster_mesh(module, cluster).cloned().ok_or_else(|| {
            LowerError::invalid_argument(
                "failed to get device ordinal as mesh for operation is not specified",
            )
        })?;
        let function = scope.function(WHAT)?;
        debug!(key = %parts.key, mesh = mesh.name(), "lowering recv to recv-at-host");

        let body = cluster_body(module, cluster);
        let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::BlockStart(body));
        let ordinal = device_ordinal(&mut emitter, &mesh, function, OrdinalWidth::I32)?;
        let program_key = get_or_create_compilation_key(&mut emitter, scope)?;
        emitter.set_point(InsertPoint::Before(recv));
        emitter.emit(
            OpKind::XlaRecvAtHost { key: parts.key },
            vec![program_key, ordinal],
            vec![output_type],
        )
    } else {
        debug!(key = %parts.key, "lowering recv to recv-from-host");
        Emitter::new(module, &mut rewrite, InsertPoint::Before(recv)).emit(
            OpKind::XlaRecvFromHost {
                key: parts.key,
                shape: parts.ty.shape.clone(),
            },
            Vec::new(),
            vec![output_type],
        )
    };
    let value = module.result(op, 0);
    Ok(replace_and_erase(rewrite, recv, parts.result, op, value))
}

/// Lower to one host receive of the declared type per receiving device, all
/// from the first device of `send_mesh`. Uses of the abstract result are
/// rewired to the last of them.
pub fn lower_recv_fan_out(
    module: &mut Module,
    recv: OpId,
    send_mesh: &Mesh,
) -> Result<Lowered, LowerError> {
    let parts = recv_parts(module, recv)?;
    let from = first_local_device(send_mesh, "sending")?.to_string();
    let receivers = parts.layout.mesh().local_devices().to_vec();
    debug!(key = %parts.key, %from, receivers = receivers.len(), "lowering recv to fan-out");

    let mut rewrite = Rewrite::new();
    let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::Before(recv));
    let mut last = None;
    for to in &receivers {
        last = Some(emitter.emit(
            host_recv(&parts.key, &from, to),
            Vec::new(),
            vec![parts.ty.clone()],
        ));
    }
    let op = last.ok_or_else(|| {
        LowerError::invalid_argument(format!(
            "receiving mesh '{}' has no local devices",
            parts.layout.mesh().name()
        ))
    })?;
    let value = module.result(op, 0);
    Ok(replace_and_erase(rewrite, recv, parts.result, op, value))
}

/// Lower to a `Case` over one host-receive branch per (sending, receiving)
/// device pair, indexed by the executing device's ordinal on the cluster's
/// mesh.
///
/// Branches receive the per-device local shape of the declared type under
/// `recv_layout`. 32-bit integers travel as 64-bit and are narrowed after
/// the `Case`, in which case the returned op is the narrowing cast.
pub fn lower_recv_dispatch(
    module: &mut Module,
    scope: &ScopeChain,
    recv: OpId,
    send_mesh: &Mesh,
    recv_layout: &Layout,
) -> Result<Lowered, LowerError> {
    let parts = recv_parts(module, recv)?;
    let cluster = scope.cluster(WHAT)?;
    let function = scope.function(WHAT)?;
    let mesh = cluster_mesh(module, cluster).cloned().ok_or_else(|| {
        LowerError::invalid_argument("cluster enclosing DTensorRecv has no device mesh")
    })?;

    let local_type = parts
        .ty
        .with_shape(recv_layout.local_shape_from_global_shape(&parts.ty.shape)?);
    let narrow = local_type.element == ElementType::I32;
    let transfer_type = if narrow {
        local_type.with_element(ElementType::I64)
    } else {
        local_type.clone()
    };
    let pairs: Vec<(String, String)> = send_mesh
        .local_devices()
        .iter()
        .cloned()
        .zip(recv_layout.mesh().local_devices().iter().cloned())
        .collect();
    debug!(
        key = %parts.key,
        branches = pairs.len(),
        %local_type,
        "lowering recv to dispatch"
    );

    let mut rewrite = Rewrite::new();
    let ordinal = {
        let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::Before(recv));
        device_ordinal(&mut emitter, &mesh, function, OrdinalWidth::I32)?
    };

    let layout_attr = Attribute::Str(recv_layout.to_string());
    let branches = generate_branches(
        module,
        &mut rewrite,
        recv,
        std::slice::from_ref(&transfer_type),
        RECV_BRANCH_TEMPLATE,
        pairs,
        |emitter, _, pair: &(String, String)| {
            let op = emitter.emit(
                host_recv(&parts.key, &pair.0, &pair.1),
                Vec::new(),
                vec![transfer_type.clone()],
            );
            emitter
                .rewrite_mut()
                .set_op_attr(op, LAYOUT_ATTR, layout_attr.clone());
            Ok(op)
        },
    )?;

    let inputs = module.op(recv).operands.clone();
    let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::Before(recv));
    let case = build_case(&mut emitter, ordinal, &inputs, branches, vec![transfer_type]);
    let results = &emitter.module().op(case).results;
    assert_eq!(results.len(), 1, "receive dispatch must produce one value");
    let received = results[0];

    let (op, value) = if narrow {
        let op = emitter.emit(OpKind::Cast, vec![received], vec![local_type]);
        (op, emitter.module().result(op, 0))
    } else {
        (case, received)
    };
    Ok(replace_and_erase(rewrite, recv, parts.result, op, value))
}
