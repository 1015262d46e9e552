//! Tensor IR for the DTensor lowering passes.
//!
//! A [`Module`] is an arena of values, ops, blocks and functions addressed by
//! index. Lowering code reads the module, allocates new ops through an
//! [`Emitter`], and describes every structural edit in a [`Rewrite`] that the
//! caller applies in one step. Enclosing scopes are passed around explicitly
//! as [`ScopeChain`]s.

pub mod emitter;
pub mod module;
pub mod ops;
pub mod printer;
pub mod rewrite;
pub mod scope;
pub mod symbol;
pub mod types;

pub use emitter::Emitter;
pub use module::{
    BlockData, BlockParent, Function, Module, ValueData, ValueDef, Visibility, DEVICE_ID_ARG,
};
pub use ops::{Attribute, Attributes, BlockId, FuncId, Literal, OpData, OpId, OpKind, ValueId};
pub use rewrite::{InsertPoint, Rewrite};
pub use scope::{cluster_body, cluster_mesh, ScopeChain};
pub use symbol::SymbolTable;
pub use types::{ElementType, TensorType};

/// Attribute recording the layout a function parameter is constrained to.
pub const PLACEMENT_ATTR: &str = "tf._layout";

/// Attribute recording the layout of an op's single result.
pub const LAYOUT_ATTR: &str = "_layout";
