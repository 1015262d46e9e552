//! Explicit enclosing-scope records.

use dtensor_common::{LowerError, Mesh};
use serde::Serialize;

use crate::module::Module;
use crate::ops::{BlockId, FuncId, OpId, OpKind};

/// The scopes enclosing an op: its nearest cluster and the function that
/// cluster lives in.
///
/// Drivers build one per op with [`ScopeChain::locate`] while walking the
/// module; tests construct them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScopeChain {
    pub function: Option<FuncId>,
    pub cluster: Option<OpId>,
}

impl ScopeChain {
    pub fn new(function: FuncId, cluster: OpId) -> Self {
        Self {
            function: Some(function),
            cluster: Some(cluster),
        }
    }

    /// Walk up from `op` to its nearest enclosing cluster and function.
    pub fn locate(module: &Module, op: OpId) -> Self {
        let mut chain = ScopeChain::default();
        let mut current = op;
        while let Some(parent) = module.parent_op(current) {
            if chain.cluster.is_none() && matches!(module.op(parent).kind, OpKind::Cluster { .. }) {
                chain.cluster = Some(parent);
            }
            current = parent;
        }
        chain.function = module.op(op).parent.and_then(|b| module.block_function(b));
        chain
    }

    /// The enclosing cluster; `what` names the op for the error message.
    pub fn cluster(&self, what: &str) -> Result<OpId, LowerError> {
        self.cluster
            .ok_or_else(|| LowerError::invalid_argument(format!("{what} is not inside a cluster")))
    }

    /// The enclosing function; `what` names the op for the error message.
    pub fn function(&self, what: &str) -> Result<FuncId, LowerError> {
        self.function
            .ok_or_else(|| LowerError::invalid_argument(format!("{what} is not inside a function")))
    }
}

/// Body block of a cluster op.
pub fn cluster_body(module: &Module, cluster: OpId) -> BlockId {
    module.op(cluster).regions[0]
}

/// The device mesh a cluster is annotated with, if any.
pub fn cluster_mesh(module: &Module, cluster: OpId) -> Option<&Mesh> {
    match &module.op(cluster).kind {
        OpKind::Cluster { mesh } => mesh.as_ref(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Visibility;
    use crate::types::{ElementType, TensorType};
    use dtensor_common::DeviceType;

    #[test]
    fn locate_finds_nearest_cluster_and_function() {
        let mut module = Module::new("m");
        let f = module.add_function(
            "main",
            vec![TensorType::scalar(ElementType::I32)],
            vec![],
            Visibility::Public,
        );
        let entry = module.function(f).entry;
        let mesh = Mesh::local("cpu", DeviceType::Cpu, "x", 1).unwrap();
        let (outer, outer_body) = module.push_cluster(entry, None);
        let (inner, inner_body) = module.push_cluster(outer_body, Some(mesh.clone()));
        let op = module.push_op(inner_body, OpKind::Return, vec![], vec![]);

        let chain = ScopeChain::locate(&module, op);
        assert_eq!(chain, ScopeChain::new(f, inner));
        assert_eq!(cluster_mesh(&module, inner), Some(&mesh));
        assert_eq!(cluster_mesh(&module, outer), None);
        assert_eq!(cluster_body(&module, inner), inner_body);
    }

    #[test]
    fn missing_scopes_are_invalid_arguments() {
        let chain = ScopeChain::default();
        assert_eq!(
            chain.cluster("DTensorSend").unwrap_err().message(),
            "DTensorSend is not inside a cluster"
        );
        assert_eq!(
            chain.function("DTensorSend").unwrap_err().message(),
            "DTensorSend is not inside a function"
        );
    }
}
