//! Module-level send/receive lowering.
//!
//! Pairs every abstract send with the abstract receive on the same channel
//! key, picks one strategy per channel from the two meshes, and lowers both
//! sides with it. Each rewrite is applied before the next op is lowered so
//! later lowerings see the program keys earlier ones created.

use dtensor_common::{Layout, LowerError, Mesh};
use dtensor_ir::{FuncId, Module, OpId, OpKind, ScopeChain};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::LowerConfig;
use crate::{recv, send, Lowered};

/// How one channel is lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    HostPrimitive,
    AcceleratorAware,
    FanOut,
    Dispatch,
}

/// Which end of a channel an op is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Send,
    Recv,
}

/// One lowered abstract op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoweredTransfer {
    pub key: String,
    pub side: Side,
    pub strategy: Strategy,
}

/// Summary of a [`lower_send_recv`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LowerReport {
    /// Lowered ops in the order they were processed.
    pub transfers: Vec<LoweredTransfer>,
    /// Names of the branch functions created for dispatch.
    pub branches: Vec<String>,
    /// Keys of abstract sends that were lowered but kept in the module.
    pub retained_sends: Vec<String>,
}

impl LowerReport {
    /// Number of lowered ops that used `strategy`.
    pub fn count(&self, strategy: Strategy) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.strategy == strategy)
            .count()
    }
}

/// Strategy for a channel from `send_mesh` to `recv_mesh`.
pub fn choose_strategy(config: &LowerConfig, send_mesh: &Mesh, recv_mesh: &Mesh) -> Strategy {
    if send_mesh.is_tpu_mesh() || recv_mesh.is_tpu_mesh() {
        return Strategy::AcceleratorAware;
    }
    if !config.prefer_dispatch && send_mesh.num_local_devices() == 1 {
        return if recv_mesh.num_local_devices() == 1 {
            Strategy::HostPrimitive
        } else {
            Strategy::FanOut
        };
    }
    Strategy::Dispatch
}

struct Endpoint {
    op: OpId,
    key: String,
    /// Source layout for sends, destination layout for receives.
    layout: Layout,
}

fn collect_endpoints(module: &Module) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let mut sends = Vec::new();
    let mut recvs = Vec::new();
    let functions: Vec<FuncId> = module.functions().map(|(id, _)| id).collect();
    for func in functions {
        for op in module.function_ops(func) {
            match &module.op(op).kind {
                OpKind::DTensorSend {
                    key, source_layout, ..
                } => sends.push(Endpoint {
                    op,
                    key: key.clone(),
                    layout: source_layout.clone(),
                }),
                OpKind::DTensorRecv { key, layout } => recvs.push(Endpoint {
                    op,
                    key: key.clone(),
                    layout: layout.clone(),
                }),
                _ => {}
            }
        }
    }
    (sends, recvs)
}

fn counterpart<'e>(
    by_key: &FxHashMap<&str, &'e Endpoint>,
    endpoint: &Endpoint,
    missing: &str,
) -> Result<&'e Endpoint, LowerError> {
    by_key.get(endpoint.key.as_str()).copied().ok_or_else(|| {
        LowerError::invalid_argument(format!("{missing} for channel '{}'", endpoint.key))
    })
}

/// Lower every abstract send and receive in `module`.
///
/// On error the module keeps the lowerings applied so far.
pub fn lower_send_recv(
    module: &mut Module,
    config: &LowerConfig,
) -> Result<LowerReport, LowerError> {
    let (sends, recvs) = collect_endpoints(module);
    let sends_by_key: FxHashMap<&str, &Endpoint> =
        sends.iter().map(|e| (e.key.as_str(), e)).collect();
    let recvs_by_key: FxHashMap<&str, &Endpoint> =
        recvs.iter().map(|e| (e.key.as_str(), e)).collect();
    let mut report = LowerReport::default();

    for endpoint in &sends {
        let peer = counterpart(&recvs_by_key, endpoint, "no DTensorRecv")?;
        let (send_mesh, recv_mesh) = (endpoint.layout.mesh(), peer.layout.mesh());
        let strategy = choose_strategy(config, send_mesh, recv_mesh);
        let scope = ScopeChain::locate(module, endpoint.op);
        debug!(key = %endpoint.key, ?strategy, "lowering DTensorSend");

        let lowered = match strategy {
            Strategy::HostPrimitive => {
                send::lower_send_to_host_send(module, endpoint.op, &endpoint.layout)?
            }
            Strategy::AcceleratorAware => {
                let from_device_zero =
                    config.broadcast_from_device_zero && send_mesh.num_local_devices() == 1;
                send::lower_send_to_xla(
                    module,
                    &scope,
                    endpoint.op,
                    &endpoint.layout,
                    from_device_zero,
                )?
            }
            Strategy::FanOut => send::lower_send_fan_out(module, endpoint.op, &endpoint.layout)?,
            Strategy::Dispatch => send::lower_send_dispatch(
                module,
                &scope,
                endpoint.op,
                &endpoint.layout,
                recv_mesh,
            )?,
        };
        if !lowered.rewrite.erases(endpoint.op) {
            report.retained_sends.push(endpoint.key.clone());
        }
        finish(module, lowered, &mut report);
        report.transfers.push(LoweredTransfer {
            key: endpoint.key.clone(),
            side: Side::Send,
            strategy,
        });
    }

    for endpoint in &recvs {
        let peer = counterpart(&sends_by_key, endpoint, "no DTensorSend")?;
        let (send_mesh, recv_mesh) = (peer.layout.mesh(), endpoint.layout.mesh());
        let strategy = choose_strategy(config, send_mesh, recv_mesh);
        let scope = ScopeChain::locate(module, endpoint.op);
        debug!(key = %endpoint.key, ?strategy, "lowering DTensorRecv");

        let lowered = match strategy {
            Strategy::HostPrimitive => {
                let output_type = recv::declared_type(module, endpoint.op)?;
                recv::lower_recv_to_host_recv(module, endpoint.op, send_mesh, output_type)?
            }
            Strategy::AcceleratorAware => recv::lower_recv_to_xla(module, &scope, endpoint.op)?,
            Strategy::FanOut => recv::lower_recv_fan_out(module, endpoint.op, send_mesh)?,
            Strategy::Dispatch => recv::lower_recv_dispatch(
                module,
                &scope,
                endpoint.op,
                send_mesh,
                &endpoint.layout,
            )?,
        };
        finish(module, lowered, &mut report);
        report.transfers.push(LoweredTransfer {
            key: endpoint.key.clone(),
            side: Side::Recv,
            strategy,
        });
    }

    debug!(
        transfers = report.transfers.len(),
        branches = report.branches.len(),
        retained = report.retained_sends.len(),
        "send/recv lowering finished"
    );
    Ok(report)
}

/// Apply `lowered`, recording any dispatch branches it created.
fn finish(module: &mut Module, lowered: Lowered, report: &mut LowerReport) {
    for op in lowered.rewrite.inserted_ops() {
        if let OpKind::Case { branches, .. } = &module.op(op).kind {
            report.branches.extend(branches.iter().cloned());
        }
    }
    lowered.apply(module);
}
