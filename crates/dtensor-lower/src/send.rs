//! Lowering of the sending side of a transfer.
//!
//! Every entry point takes the `DTensorSend` to lower plus the layout the
//! sent value has on the sending mesh, and returns the new leaf op together
//! with the rewrite to apply. The abstract op is erased by the rewrite except
//! where noted.

use dtensor_common::{DeviceType, Layout, LowerError, Mesh};
use dtensor_ir::{
    cluster_mesh, Attribute, ElementType, Emitter, InsertPoint, Module, OpId, OpKind, Rewrite,
    ScopeChain, ValueId, PLACEMENT_ATTR,
};
use tracing::{debug, warn};

use crate::compile_key::get_or_create_compilation_key;
use crate::dispatch::{build_case, generate_branches, SEND_BRANCH_TEMPLATE};
use crate::ordinal::{device_ordinal, OrdinalWidth};
use crate::{after_definition, first_local_device, Lowered};

const WHAT: &str = "DTensorSend";

struct SendParts {
    key: String,
    input: ValueId,
    target_layout: Layout,
}

fn send_parts(module: &Module, send: OpId) -> Result<SendParts, LowerError> {
    let data = module.op(send);
    let OpKind::DTensorSend {
        key, target_layout, ..
    } = &data.kind
    else {
        return Err(LowerError::invalid_argument(format!(
            "expected tf.DTensorSend, found {}",
            data.kind.name()
        )));
    };
    let [input] = data.operands[..] else {
        return Err(LowerError::invalid_argument(format!(
            "DTensorSend '{key}' must have exactly one operand, found {}",
            data.operands.len()
        )));
    };
    Ok(SendParts {
        key: key.clone(),
        input,
        target_layout: target_layout.clone(),
    })
}

fn host_send(key: &str, send_device: &str, recv_device: &str) -> OpKind {
    OpKind::HostSend {
        key: key.to_string(),
        send_device: send_device.to_string(),
        send_device_incarnation: 0,
        recv_device: recv_device.to_string(),
        client_terminated: false,
    }
}

/// Lower to a single host send from the first sending device to the first
/// receiving device, placed right after the sent value is defined.
pub fn lower_send_to_host_send(
    module: &mut Module,
    send: OpId,
    send_layout: &Layout,
) -> Result<Lowered, LowerError> {
    let parts = send_parts(module, send)?;
    let from = first_local_device(send_layout.mesh(), "sending")?.to_string();
    let to = first_local_device(parts.target_layout.mesh(), "receiving")?.to_string();
    debug!(key = %parts.key, %from, %to, "lowering send to host send");

    let mut rewrite = Rewrite::new();
    let point = after_definition(module, parts.input, send);
    let op = Emitter::new(module, &mut rewrite, point).emit(
        host_send(&parts.key, &from, &to),
        vec![parts.input],
        Vec::new(),
    );
    rewrite.erase(send);
    Ok(Lowered {
        op,
        result: None,
        rewrite,
    })
}

/// Lower to an accelerator-aware send.
///
/// From a host mesh this emits a send-from-host fed by the cluster's program
/// key and a device ordinal: constant 0 when `send_from_device_zero` is set,
/// otherwise the ordinal of the executing device on the sending mesh. From
/// an accelerator mesh it emits a send-to-host.
pub fn lower_send_to_xla(
    module: &mut Module,
    scope: &ScopeChain,
    send: OpId,
    send_layout: &Layout,
    send_from_device_zero: bool,
) -> Result<Lowered, LowerError> {
    let parts = send_parts(module, send)?;
    let mut rewrite = Rewrite::new();
    let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::Before(send));

    let op = if send_layout.mesh().is_tpu_mesh() {
        debug!(key = %parts.key, "lowering send to send-to-host");
        emitter.emit(
            OpKind::XlaSendToHost { key: parts.key },
            vec![parts.input],
            Vec::new(),
        )
    } else {
        debug!(key = %parts.key, send_from_device_zero, "lowering send to send-from-host");
        let program_key = get_or_create_compilation_key(&mut emitter, scope)?;
        let ordinal = if send_from_device_zero {
            emitter.int_scalar(0)
        } else {
            scope.cluster(WHAT)?;
            let function = scope.function(WHAT)?;
            device_ordinal(&mut emitter, send_layout.mesh(), function, OrdinalWidth::I32)?
        };
        emitter.emit(
            OpKind::XlaSendFromHost { key: parts.key },
            vec![parts.input, program_key, ordinal],
            Vec::new(),
        )
    };
    rewrite.erase(send);
    Ok(Lowered {
        op,
        result: None,
        rewrite,
    })
}

/// Lower to one host send per receiving device, all from the first sending
/// device. Returns the last of them.
pub fn lower_send_fan_out(
    module: &mut Module,
    send: OpId,
    send_layout: &Layout,
) -> Result<Lowered, LowerError> {
    let parts = send_parts(module, send)?;
    let from = first_local_device(send_layout.mesh(), "sending")?.to_string();
    let receivers = parts.target_layout.mesh().local_devices().to_vec();
    debug!(key = %parts.key, %from, receivers = receivers.len(), "lowering send to fan-out");

    let mut rewrite = Rewrite::new();
    let point = after_definition(module, parts.input, send);
    let mut emitter = Emitter::new(module, &mut rewrite, point);
    let mut last = None;
    for to in &receivers {
        last = Some(emitter.emit(
            host_send(&parts.key, &from, to),
            vec![parts.input],
            Vec::new(),
        ));
    }
    let op = last.ok_or_else(|| {
        LowerError::invalid_argument(format!(
            "receiving mesh '{}' has no local devices",
            parts.target_layout.mesh().name()
        ))
    })?;
    rewrite.erase(send);
    Ok(Lowered {
        op,
        result: None,
        rewrite,
    })
}

/// Lower to a `Case` over one host-send branch per (sending, receiving)
/// device pair, indexed by the executing device's ordinal on the cluster's
/// mesh.
///
/// Pairs are formed by zipping the local devices of both meshes, so surplus
/// devices on the longer side get no branch. 32-bit integer values are
/// widened to 64 bits inside each branch. The abstract send is erased only
/// when the receiving mesh is a GPU mesh.
pub fn lower_send_dispatch(
    module: &mut Module,
    scope: &ScopeChain,
    send: OpId,
    send_layout: &Layout,
    recv_mesh: &Mesh,
) -> Result<Lowered, LowerError> {
    let parts = send_parts(module, send)?;
    let cluster = scope.cluster(WHAT)?;
    let function = scope.function(WHAT)?;
    let mesh = cluster_mesh(module, cluster).cloned().ok_or_else(|| {
        LowerError::invalid_argument("cluster enclosing DTensorSend has no device mesh")
    })?;
    let widen = module.value_type(parts.input).element == ElementType::I32;
    let pairs: Vec<(String, String)> = send_layout
        .mesh()
        .local_devices()
        .iter()
        .cloned()
        .zip(recv_mesh.local_devices().iter().cloned())
        .collect();
    debug!(key = %parts.key, branches = pairs.len(), widen, "lowering send to dispatch");

    let mut rewrite = Rewrite::new();
    let ordinal = {
        let mut emitter = Emitter::new(module, &mut rewrite, InsertPoint::Before(send));
        device_ordinal(&mut emitter, &mesh, function, OrdinalWidth::I32)?
    };

    let placement = Attribute::Str(send_layout.to_string());
    let branches = generate_branches(
        module,
        &mut rewrite,
        send,
        &[],
        SEND_BRANCH_TEMPLATE,
        pairs,
        |emitter, branch, pair: &(String, String)| {
            let arg = branch.arg.ok_or_else(|| {
                LowerError::invalid_argument("send branch has no parameter for the sent value")
            })?;
            emitter
                .rewrite_mut()
                .set_arg_attr(branch.function, 0, PLACEMENT_ATTR, placement.clone());
            let value = if widen {
                emitter.cast(arg, ElementType::I64)
            } else {
                arg
            };
            Ok(emitter.emit(
                host_send(&parts.key, &pair.0, &pair.1),
                vec![value],
                Vec::new(),
            ))
        },
    )?;

    let op = build_case(
        &mut Emitter::new(module, &mut rewrite, InsertPoint::Before(send)),
        ordinal,
        &[parts.input],
        branches,
        Vec::new(),
    );
    if recv_mesh.device_type() == DeviceType::Gpu {
        rewrite.erase(send);
    } else {
        warn!(
            key = %parts.key,
            recv_mesh = recv_mesh.name(),
            "keeping DTensorSend after dispatch lowering; receiving mesh is not a GPU mesh"
        );
    }
    Ok(Lowered {
        op,
        result: None,
        rewrite,
    })
}
