//! Tensor layouts: the placement of one tensor value across a [`Mesh`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::mesh::Mesh;

/// How one tensor dimension is split across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardingSpec {
    /// Every device holds the whole dimension.
    Unsharded,
    /// The dimension is split evenly along the named mesh dimension.
    Sharded(String),
}

impl ShardingSpec {
    pub fn sharded(dim: impl Into<String>) -> Self {
        ShardingSpec::Sharded(dim.into())
    }
}

impl fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingSpec::Unsharded => f.write_str("unsharded"),
            ShardingSpec::Sharded(dim) => f.write_str(dim),
        }
    }
}

/// A mesh plus one [`ShardingSpec`] per tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Layout {
    mesh: Mesh,
    sharding_specs: Vec<ShardingSpec>,
}

impl Layout {
    /// Build a layout, checking that every sharded dimension names a mesh
    /// dimension.
    pub fn new(mesh: Mesh, sharding_specs: Vec<ShardingSpec>) -> Result<Self, MeshError> {
        for spec in &sharding_specs {
            if let ShardingSpec::Sharded(dim) = spec {
                if mesh.dim_size(dim).is_none() {
                    return Err(MeshError::UnknownMeshDimension { dim: dim.clone() });
                }
            }
        }
        Ok(Self {
            mesh,
            sharding_specs,
        })
    }

    /// A fully replicated layout of the given rank.
    pub fn replicated(mesh: Mesh, rank: usize) -> Self {
        Self {
            mesh,
            sharding_specs: vec![ShardingSpec::Unsharded; rank],
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn sharding_specs(&self) -> &[ShardingSpec] {
        &self.sharding_specs
    }

    pub fn rank(&self) -> usize {
        self.sharding_specs.len()
    }

    pub fn is_fully_replicated(&self) -> bool {
        self.sharding_specs
            .iter()
            .all(|s| matches!(s, ShardingSpec::Unsharded))
    }

    /// Number of shards dimension `dim` is split into.
    pub fn num_shards_for_dim(&self, dim: usize) -> i64 {
        match self.sharding_specs.get(dim) {
            Some(ShardingSpec::Sharded(name)) => self.mesh.dim_size(name).unwrap_or(1),
            _ => 1,
        }
    }

    /// Per-device shape of a tensor whose global shape is `global`.
    ///
    /// Dynamic dimensions (`-1`) stay dynamic. Dimensions past the layout's
    /// rank are left whole. A static sharded dimension must divide evenly
    /// by its shard count.
    pub fn local_shape_from_global_shape(&self, global: &[i64]) -> Result<Vec<i64>, MeshError> {
        global
            .iter()
            .enumerate()
            .map(|(dim, &size)| {
                let shards = self.num_shards_for_dim(dim);
                if size < 0 {
                    Ok(size)
                } else if size % shards != 0 {
                    Err(MeshError::UnevenSharding { dim, size, shards })
                } else {
                    Ok(size / shards)
                }
            })
            .collect()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let specs: Vec<String> = self.sharding_specs.iter().map(|s| s.to_string()).collect();
        write!(f, "sharding_specs:{}, mesh:{}", specs.join(","), self.mesh)
    }
}

impl FromStr for Layout {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MeshError::Malformed {
            what: "layout",
            input: s.to_string(),
        };
        let rest = s.strip_prefix("sharding_specs:").ok_or_else(malformed)?;
        let (specs, mesh) = rest.split_once(", mesh:").ok_or_else(malformed)?;
        let sharding_specs = specs
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "unsharded" => ShardingSpec::Unsharded,
                dim => ShardingSpec::sharded(dim),
            })
            .collect();
        Layout::new(mesh.parse()?, sharding_specs)
    }
}

impl TryFrom<String> for Layout {
    type Error = MeshError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Layout> for String {
    fn from(layout: Layout) -> Self {
        layout.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{DeviceType, MeshDimension};

    fn mesh_2x2() -> Mesh {
        let devices = (0..4)
            .map(|i| crate::mesh::device_name("localhost", 0, DeviceType::Gpu, i))
            .collect();
        Mesh::new(
            "gpu_mesh",
            vec![MeshDimension::new("x", 2), MeshDimension::new("y", 2)],
            vec![0, 1, 2, 3],
            vec![0, 1, 2, 3],
            devices,
        )
        .unwrap()
    }

    #[test]
    fn local_shape_divides_sharded_dims() {
        let layout = Layout::new(
            mesh_2x2(),
            vec![ShardingSpec::sharded("x"), ShardingSpec::Unsharded],
        )
        .unwrap();
        assert_eq!(layout.local_shape_from_global_shape(&[8, 6]).unwrap(), vec![4, 6]);
        assert_eq!(layout.local_shape_from_global_shape(&[-1, 6]).unwrap(), vec![-1, 6]);
        assert!(!layout.is_fully_replicated());
    }

    #[test]
    fn local_shape_rejects_uneven_split() {
        let layout = Layout::new(mesh_2x2(), vec![ShardingSpec::sharded("x")]).unwrap();
        assert_eq!(
            layout.local_shape_from_global_shape(&[3]),
            Err(MeshError::UnevenSharding {
                dim: 0,
                size: 3,
                shards: 2,
            })
        );
    }

    #[test]
    fn replicated_layout_keeps_global_shape() {
        let layout = Layout::replicated(mesh_2x2(), 2);
        assert!(layout.is_fully_replicated());
        assert_eq!(layout.local_shape_from_global_shape(&[8, 6]).unwrap(), vec![8, 6]);
    }

    #[test]
    fn layout_rejects_unknown_dimension() {
        let err = Layout::new(mesh_2x2(), vec![ShardingSpec::sharded("z")]).unwrap_err();
        assert_eq!(err, MeshError::UnknownMeshDimension { dim: "z".into() });
    }

    #[test]
    fn layout_string_round_trip() {
        let layout = Layout::new(
            mesh_2x2(),
            vec![ShardingSpec::Unsharded, ShardingSpec::sharded("y")],
        )
        .unwrap();
        let text = layout.to_string();
        assert!(text.starts_with("sharding_specs:unsharded,y, mesh:gpu_mesh|x=2,y=2|"));
        assert_eq!(text.parse::<Layout>().unwrap(), layout);
    }

    #[test]
    fn scalar_layout_round_trip() {
        let layout = Layout::replicated(mesh_2x2(), 0);
        assert_eq!(layout.to_string().parse::<Layout>().unwrap(), layout);
    }
}
