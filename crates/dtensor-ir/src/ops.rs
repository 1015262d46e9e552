//! Operation definitions.
//!
//! Every operation is an [`OpData`] in the [`crate::Module`] arena. The
//! operation-specific payload lives in [`OpKind`]; free-form attributes such as
//! the per-op layout annotation live in [`OpData::attrs`].

use std::collections::BTreeMap;
use std::fmt;

use dtensor_common::{Layout, Mesh};
use serde::{Deserialize, Serialize};

/// Index of a value in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Index of an operation in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

/// Index of a block in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Index of a function in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Attribute value attached to an op or a function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Str(s) => write!(f, "{s:?}"),
            Attribute::Int(i) => write!(f, "{i}"),
            Attribute::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Attributes keyed by name, kept sorted so printing is deterministic.
pub type Attributes = BTreeMap<String, Attribute>;

/// Dense constant payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
            write!(f, "dense<[{}]>", parts.join(", "))
        }
        match self {
            Literal::Bool(v) => list(f, v),
            Literal::I32(v) => list(f, v),
            Literal::I64(v) => list(f, v),
            Literal::F32(v) => list(f, v),
        }
    }
}

/// The operation-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    // ── Structure ────────────────────────────────────────────────────
    /// Region whose body runs on the devices of `mesh`. One region.
    Cluster { mesh: Option<Mesh> },
    /// Function terminator; operands are the returned values.
    Return,

    // ── Abstract transfer ────────────────────────────────────────────
    /// Operand 0 is the sent value.
    DTensorSend {
        key: String,
        source_layout: Layout,
        target_layout: Layout,
    },
    /// Result 0 is the received value, typed with the global shape.
    DTensorRecv { key: String, layout: Layout },

    // ── Tensor ops ───────────────────────────────────────────────────
    Const { value: Literal },
    /// Reshape operand 0 to the result type.
    Reshape,
    /// Slice operand 0 starting at operand 1 with sizes operand 2.
    Slice,
    /// Convert operand 0 to the result element type.
    Cast,
    Add,

    // ── Host point-to-point ──────────────────────────────────────────
    HostSend {
        key: String,
        send_device: String,
        send_device_incarnation: i64,
        recv_device: String,
        client_terminated: bool,
    },
    HostRecv {
        key: String,
        send_device: String,
        send_device_incarnation: i64,
        recv_device: String,
        client_terminated: bool,
    },

    // ── Host <-> accelerator ─────────────────────────────────────────
    /// Operands: the sent values, then the program key, then the device
    /// ordinal.
    XlaSendFromHost { key: String },
    /// Operand 0 is the sent value.
    XlaSendToHost { key: String },
    /// Operands: program key, device ordinal.
    XlaRecvAtHost { key: String },
    XlaRecvFromHost { key: String, shape: Vec<i64> },
    /// Placeholder for the program key resolved during device compilation.
    CompilationKeyPlaceholder,

    // ── Dispatch ─────────────────────────────────────────────────────
    /// Operand 0 is the branch index; the remaining operands are forwarded to
    /// the selected branch function.
    Case {
        branches: Vec<String>,
        is_stateless: bool,
    },
}

impl OpKind {
    /// Fully qualified op name used by the printer.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Cluster { .. } => "tf_device.cluster",
            OpKind::Return => "func.return",
            OpKind::DTensorSend { .. } => "tf.DTensorSend",
            OpKind::DTensorRecv { .. } => "tf.DTensorRecv",
            OpKind::Const { .. } => "tf.Const",
            OpKind::Reshape => "tf.Reshape",
            OpKind::Slice => "tf.Slice",
            OpKind::Cast => "tf.Cast",
            OpKind::Add => "tf.AddV2",
            OpKind::HostSend { .. } => "tf._HostSend",
            OpKind::HostRecv { .. } => "tf._HostRecv",
            OpKind::XlaSendFromHost { .. } => "tf._XlaSendFromHostV2",
            OpKind::XlaSendToHost { .. } => "tf.XlaSendToHost",
            OpKind::XlaRecvAtHost { .. } => "tf._XlaRecvAtHostV2",
            OpKind::XlaRecvFromHost { .. } => "tf.XlaRecvFromHost",
            OpKind::CompilationKeyPlaceholder => "tf._TPUCompileMlirPlaceholderProgramKey",
            OpKind::Case { .. } => "tf.Case",
        }
    }

    /// The op name without its dialect prefix, usable inside symbol names.
    pub fn mnemonic(&self) -> &'static str {
        let name = self.name();
        name.split_once('.').map_or(name, |(_, rest)| rest)
    }

    /// Channel key of a transfer op.
    pub fn key(&self) -> Option<&str> {
        match self {
            OpKind::DTensorSend { key, .. }
            | OpKind::DTensorRecv { key, .. }
            | OpKind::HostSend { key, .. }
            | OpKind::HostRecv { key, .. }
            | OpKind::XlaSendFromHost { key }
            | OpKind::XlaSendToHost { key }
            | OpKind::XlaRecvAtHost { key }
            | OpKind::XlaRecvFromHost { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn is_abstract_transfer(&self) -> bool {
        matches!(self, OpKind::DTensorSend { .. } | OpKind::DTensorRecv { .. })
    }

    /// Payload fields rendered as printable attributes, in a fixed order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        fn s(v: &str) -> String {
            format!("{v:?}")
        }
        match self {
            OpKind::Cluster { mesh } => match mesh {
                Some(mesh) => vec![("mesh", s(&mesh.to_string()))],
                None => Vec::new(),
            },
            OpKind::Return
            | OpKind::Reshape
            | OpKind::Slice
            | OpKind::Cast
            | OpKind::Add
            | OpKind::CompilationKeyPlaceholder => Vec::new(),
            OpKind::DTensorSend {
                key,
                source_layout,
                target_layout,
            } => vec![
                ("key", s(key)),
                ("source_layout", s(&source_layout.to_string())),
                ("target_layout", s(&target_layout.to_string())),
            ],
            OpKind::DTensorRecv { key, layout } => {
                vec![("key", s(key)), ("layout", s(&layout.to_string()))]
            }
            OpKind::Const { value } => vec![("value", value.to_string())],
            OpKind::HostSend {
                key,
                send_device,
                send_device_incarnation,
                recv_device,
                client_terminated,
            }
            | OpKind::HostRecv {
                key,
                send_device,
                send_device_incarnation,
                recv_device,
                client_terminated,
            } => vec![
                ("tensor_name", s(key)),
                ("send_device", s(send_device)),
                ("send_device_incarnation", send_device_incarnation.to_string()),
                ("recv_device", s(recv_device)),
                ("client_terminated", client_terminated.to_string()),
            ],
            OpKind::XlaSendFromHost { key }
            | OpKind::XlaSendToHost { key }
            | OpKind::XlaRecvAtHost { key } => vec![("key", s(key))],
            OpKind::XlaRecvFromHost { key, shape } => {
                let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
                vec![("key", s(key)), ("shape", format!("[{}]", dims.join(", ")))]
            }
            OpKind::Case {
                branches,
                is_stateless,
            } => {
                let refs: Vec<String> = branches.iter().map(|b| format!("@{b}")).collect();
                vec![
                    ("branches", format!("[{}]", refs.join(", "))),
                    ("is_stateless", is_stateless.to_string()),
                ]
            }
        }
    }
}

/// One operation in the module arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpData {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub attrs: Attributes,
    /// Single-block regions owned by this op.
    pub regions: Vec<BlockId>,
    /// Block this op is placed in; `None` while detached.
    pub parent: Option<BlockId>,
    pub erased: bool,
}

impl OpData {
    /// Whether the op is placed in a block and not erased.
    pub fn is_live(&self) -> bool {
        !self.erased && self.parent.is_some()
    }
}
