//! Single-process reference interpreter for lowered modules.
//!
//! Runs one device's copy of a function at a time. Transfers between runs go
//! through a shared [`Rendezvous`], so a test can execute the sending
//! program on each sending device and then the receiving program on each
//! receiving device and compare what arrives.

pub mod interp;
pub mod rendezvous;
pub mod tensor;

use dtensor_ir::ValueId;
use thiserror::Error;

pub use interp::Interpreter;
pub use rendezvous::Rendezvous;
pub use tensor::{Tensor, TensorData};

/// Execution failure.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum SimError {
    #[error("cannot execute abstract op {op}; lower it first")]
    Unlowered { op: &'static str },

    #[error("nothing was sent on channel '{key}' for {device}")]
    MissingTransfer { key: String, device: String },

    #[error("unknown function @{0}")]
    UnknownFunction(String),

    #[error("function @{name} takes {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("case index {index} is out of range for {branches} branches")]
    BranchOutOfRange { index: i64, branches: usize },

    #[error("value {0} is used before it is defined")]
    Undefined(ValueId),

    #[error("type error: {0}")]
    Type(String),
}
