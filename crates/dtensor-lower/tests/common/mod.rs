//! Shared fixtures for the lowering integration tests.
#![allow(dead_code)]

use dtensor_common::{DeviceType, Layout, Mesh, MeshDimension};
use dtensor_ir::{ElementType, Module, OpId, OpKind, ScopeChain, TensorType, Visibility};
use dtensor_sim::{Interpreter, SimError, Tensor};

pub const KEY: &str = "channel_0";
pub const SEND_FN: &str = "send_main";
pub const RECV_FN: &str = "recv_main";

/// A module with one abstract channel: `@send_main(%device_id, %x)` sends
/// `%x` from a cluster on the sending mesh, `@recv_main(%device_id)`
/// receives it in a cluster on the receiving mesh and returns it.
pub struct Channel {
    pub module: Module,
    pub send: OpId,
    pub recv: OpId,
    pub send_scope: ScopeChain,
    pub recv_scope: ScopeChain,
    pub send_layout: Layout,
    pub recv_layout: Layout,
}

pub fn i32_scalar() -> TensorType {
    TensorType::scalar(ElementType::I32)
}

pub fn mesh(name: &str, device_type: DeviceType, count: usize) -> Mesh {
    Mesh::local(name, device_type, "x", count).unwrap()
}

/// A single-dimension mesh over `global` devices of which `local_ids` are
/// local, in that order.
pub fn partial_mesh(
    name: &str,
    device_type: DeviceType,
    global: i64,
    local_ids: &[i64],
) -> Mesh {
    let devices = local_ids
        .iter()
        .map(|&id| dtensor_common::mesh::device_name("localhost", 0, device_type, id))
        .collect();
    Mesh::with_device_type(
        name,
        device_type,
        vec![MeshDimension::new("x", global)],
        (0..global).collect(),
        local_ids.to_vec(),
        devices,
    )
    .unwrap()
}

pub fn channel(send_mesh: &Mesh, recv_mesh: &Mesh, ty: TensorType) -> Channel {
    channel_with_cluster_meshes(send_mesh, recv_mesh, ty, true)
}

/// Like [`channel`]; when `annotate` is false the clusters carry no mesh.
pub fn channel_with_cluster_meshes(
    send_mesh: &Mesh,
    recv_mesh: &Mesh,
    ty: TensorType,
    annotate: bool,
) -> Channel {
    let send_layout = Layout::replicated(send_mesh.clone(), ty.rank());
    let recv_layout = Layout::replicated(recv_mesh.clone(), ty.rank());
    let mut module = Module::new("transfer");

    let send_fn = module.add_function(
        SEND_FN,
        vec![i32_scalar(), ty.clone()],
        vec![],
        Visibility::Public,
    );
    let entry = module.function(send_fn).entry;
    let x = module.args(send_fn)[1];
    let (send_cluster, body) = module.push_cluster(entry, annotate.then(|| send_mesh.clone()));
    let send = module.push_op(
        body,
        OpKind::DTensorSend {
            key: KEY.to_string(),
            source_layout: send_layout.clone(),
            target_layout: recv_layout.clone(),
        },
        vec![x],
        vec![],
    );
    module.push_op(entry, OpKind::Return, vec![], vec![]);

    let recv_fn = module.add_function(
        RECV_FN,
        vec![i32_scalar()],
        vec![ty.clone()],
        Visibility::Public,
    );
    let entry = module.function(recv_fn).entry;
    let (recv_cluster, body) = module.push_cluster(entry, annotate.then(|| recv_mesh.clone()));
    let recv = module.push_op(
        body,
        OpKind::DTensorRecv {
            key: KEY.to_string(),
            layout: recv_layout.clone(),
        },
        vec![],
        vec![ty],
    );
    let received = module.result(recv, 0);
    module.push_op(entry, OpKind::Return, vec![received], vec![]);

    Channel {
        module,
        send,
        recv,
        send_scope: ScopeChain::new(send_fn, send_cluster),
        recv_scope: ScopeChain::new(recv_fn, recv_cluster),
        send_layout,
        recv_layout,
    }
}

pub fn is_host_send(kind: &OpKind) -> bool {
    matches!(kind, OpKind::HostSend { .. })
}

pub fn is_host_recv(kind: &OpKind) -> bool {
    matches!(kind, OpKind::HostRecv { .. })
}

pub fn is_abstract(kind: &OpKind) -> bool {
    kind.is_abstract_transfer()
}

/// Run the sending program on `device_id` with `value`.
pub fn run_send(sim: &mut Interpreter, module: &Module, device_id: i32, value: Tensor) {
    sim.run(module, SEND_FN, device_id, vec![value])
        .unwrap_or_else(|e| panic!("send on device {device_id} failed: {e}"));
}

/// Run the receiving program on `device_id`.
pub fn run_recv(
    sim: &mut Interpreter,
    module: &Module,
    device_id: i32,
) -> Result<Tensor, SimError> {
    let mut results = sim.run(module, RECV_FN, device_id, vec![])?;
    assert_eq!(results.len(), 1, "receiving program returns one value");
    Ok(results.remove(0))
}
