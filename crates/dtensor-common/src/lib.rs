//! Shared types for the DTensor lowering passes.
//!
//! [`mesh::Mesh`] and [`layout::Layout`] are produced by layout inference and
//! only ever read by the lowering passes. [`error::LowerError`] is the single
//! error kind every lowering entry point reports.

pub mod error;
pub mod layout;
pub mod mesh;

pub use error::{LowerError, MeshError};
pub use layout::{Layout, ShardingSpec};
pub use mesh::{DeviceType, Mesh, MeshDimension};
