//! Lowering of abstract DTensor send/receive ops.
//!
//! Upstream passes leave placement-agnostic `DTensorSend` / `DTensorRecv`
//! pairs in the IR. This crate rewrites each side into the communication
//! primitives a backend supports:
//!
//! - [`send`] / [`recv`]: one entry point per strategy (host point-to-point,
//!   host <-> accelerator, uniform fan-out, per-device-pair dispatch).
//! - [`ordinal`]: runtime computation of the executing device's local rank.
//! - [`compile_key`]: the per-cluster program key placeholder.
//! - [`dispatch`]: outlined branch functions and the `Case` construct over
//!   them.
//! - [`pass`]: a module-level driver that pairs the two sides of each channel
//!   and picks a strategy.
//!
//! Entry points never edit the module's op graph directly. They return a
//! [`Lowered`] whose [`dtensor_ir::Rewrite`] the caller applies.

pub mod compile_key;
pub mod config;
pub mod dispatch;
pub mod ordinal;
pub mod pass;
pub mod recv;
pub mod send;

use dtensor_common::{LowerError, Mesh};
use dtensor_ir::{InsertPoint, Module, OpId, Rewrite, ValueId};

pub use config::LowerConfig;
pub use pass::{lower_send_recv, LowerReport, Strategy};

/// Result of lowering one abstract op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lowered {
    /// The new leaf op: the last transfer primitive, the dispatch construct,
    /// or the cast following it.
    pub op: OpId,
    /// The value replacing the abstract receive's result. `None` for sends.
    pub result: Option<ValueId>,
    /// Edits still to be applied to the module.
    pub rewrite: Rewrite,
}

impl Lowered {
    /// Apply the rewrite and return the new leaf op.
    pub fn apply(self, module: &mut Module) -> OpId {
        self.rewrite.apply(module);
        self.op
    }
}

/// Name of the first local device of `mesh`.
pub(crate) fn first_local_device<'m>(mesh: &'m Mesh, side: &str) -> Result<&'m str, LowerError> {
    mesh.local_devices()
        .first()
        .map(String::as_str)
        .ok_or_else(|| {
            LowerError::invalid_argument(format!(
                "{side} mesh '{}' has no local devices",
                mesh.name()
            ))
        })
}

/// Insertion point right after the op defining `value`, or before `anchor`
/// when `value` is a block argument.
pub(crate) fn after_definition(module: &Module, value: ValueId, anchor: OpId) -> InsertPoint {
    match module.defining_op(value) {
        Some(def) if module.op(def).is_live() => InsertPoint::After(def),
        _ => InsertPoint::Before(anchor),
    }
}
