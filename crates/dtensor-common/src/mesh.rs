//! Device meshes.
//!
//! A [`Mesh`] names a topology of devices of one [`DeviceType`]. It lists every
//! global device id of the topology and the subset of ids whose devices are
//! resident in the current process (the "local" devices). A cluster job usually
//! sees the whole multi-host topology but owns only its local slice.
//!
//! Meshes serialize to a pipe-separated string:
//!
//! ```text
//! name|x=2,y=2|0,1,2,3|0,1|/job:localhost/replica:0/task:0/device:CPU:0,/job:localhost/replica:0/task:0/device:CPU:1
//! ```
//!
//! A mesh with no local devices has no device names to infer its type from, so
//! its string carries the type as a sixth field: `name|x=4|0,1,2,3|||TPU`.

use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// The kind of device a mesh is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// General-purpose host.
    Cpu,
    /// GPU-class backend.
    Gpu,
    /// Specialized accelerator cluster.
    Tpu,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Tpu => "TPU",
        }
    }

    /// Parse the device type out of a fully qualified device name such as
    /// `/job:localhost/replica:0/task:0/device:TPU:3`.
    pub fn from_device_name(device: &str) -> Result<Self, MeshError> {
        let unknown = || MeshError::UnknownDeviceType {
            device: device.to_string(),
        };
        let rest = device
            .rsplit_once("device:")
            .map(|(_, rest)| rest)
            .ok_or_else(unknown)?;
        let ty = rest.split(':').next().ok_or_else(unknown)?;
        ty.parse().map_err(|_| unknown())
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CPU" => Ok(DeviceType::Cpu),
            "GPU" => Ok(DeviceType::Gpu),
            "TPU" => Ok(DeviceType::Tpu),
            other => Err(MeshError::UnknownDeviceType {
                device: other.to_string(),
            }),
        }
    }
}

/// One named dimension of a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshDimension {
    pub name: String,
    pub size: i64,
}

impl MeshDimension {
    pub fn new(name: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// A named device topology.
///
/// Immutable once constructed; construction checks that the dimensions, the
/// global and local device ids, and the local device names are consistent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mesh {
    name: String,
    device_type: DeviceType,
    dims: Vec<MeshDimension>,
    global_device_ids: Vec<i64>,
    local_device_ids: Vec<i64>,
    local_devices: Vec<String>,
}

impl Mesh {
    /// Build a mesh whose device type is inferred from its local device names.
    pub fn new(
        name: impl Into<String>,
        dims: Vec<MeshDimension>,
        global_device_ids: Vec<i64>,
        local_device_ids: Vec<i64>,
        local_devices: Vec<String>,
    ) -> Result<Self, MeshError> {
        let name = name.into();
        let first = local_devices.first().ok_or_else(|| MeshError::Malformed {
            what: "mesh without local devices or explicit device type",
            input: name.clone(),
        })?;
        let device_type = DeviceType::from_device_name(first)?;
        Self::with_device_type(
            name,
            device_type,
            dims,
            global_device_ids,
            local_device_ids,
            local_devices,
        )
    }

    /// Build a mesh with an explicit device type. Local device names, if any,
    /// must agree with it.
    pub fn with_device_type(
        name: impl Into<String>,
        device_type: DeviceType,
        dims: Vec<MeshDimension>,
        global_device_ids: Vec<i64>,
        local_device_ids: Vec<i64>,
        local_devices: Vec<String>,
    ) -> Result<Self, MeshError> {
        let name = name.into();
        if let Some(dim) = dims.iter().find(|d| d.size <= 0) {
            return Err(MeshError::NonPositiveDimension {
                mesh: name,
                dim: dim.name.clone(),
                size: dim.size,
            });
        }
        let dims_product: i64 = dims.iter().map(|d| d.size).product();
        if dims_product != global_device_ids.len() as i64 {
            return Err(MeshError::DeviceCountMismatch {
                dims_product,
                global_count: global_device_ids.len(),
            });
        }
        let num_devices = global_device_ids.len();
        for &id in &global_device_ids {
            if id < 0 || id as usize >= num_devices {
                return Err(MeshError::DeviceIdOutOfRange { id, num_devices });
            }
        }
        let globals: FxHashSet<i64> = global_device_ids.iter().copied().collect();
        for &id in &local_device_ids {
            if !globals.contains(&id) {
                return Err(MeshError::UnknownLocalDevice {
                    id,
                    mesh: name.clone(),
                });
            }
        }
        if local_device_ids.len() != local_devices.len() {
            return Err(MeshError::LocalDeviceNameMismatch {
                mesh: name.clone(),
                ids: local_device_ids.len(),
                names: local_devices.len(),
            });
        }
        for device in &local_devices {
            let ty = DeviceType::from_device_name(device)?;
            if ty != device_type {
                return Err(MeshError::MixedDeviceTypes {
                    mesh: name.clone(),
                    first: device_type.to_string(),
                    second: ty.to_string(),
                });
            }
        }
        Ok(Self {
            name,
            device_type,
            dims,
            global_device_ids,
            local_device_ids,
            local_devices,
        })
    }

    /// A one-dimensional mesh whose `count` devices are all local to
    /// `/job:localhost`, numbered `0..count`.
    pub fn local(
        name: impl Into<String>,
        device_type: DeviceType,
        dim: &str,
        count: usize,
    ) -> Result<Self, MeshError> {
        let ids: Vec<i64> = (0..count as i64).collect();
        let devices = ids
            .iter()
            .map(|id| device_name("localhost", 0, device_type, *id))
            .collect();
        Self::with_device_type(
            name,
            device_type,
            vec![MeshDimension::new(dim, count as i64)],
            ids.clone(),
            ids,
            devices,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn dims(&self) -> &[MeshDimension] {
        &self.dims
    }

    /// Size of the named dimension, if the mesh has it.
    pub fn dim_size(&self, name: &str) -> Option<i64> {
        self.dims.iter().find(|d| d.name == name).map(|d| d.size)
    }

    /// Total number of devices in the topology, local or not.
    pub fn num_devices(&self) -> usize {
        self.global_device_ids.len()
    }

    pub fn global_device_ids(&self) -> &[i64] {
        &self.global_device_ids
    }

    pub fn local_device_ids(&self) -> &[i64] {
        &self.local_device_ids
    }

    /// Fully qualified names of the local devices, in local-id order.
    pub fn local_devices(&self) -> &[String] {
        &self.local_devices
    }

    pub fn num_local_devices(&self) -> usize {
        self.local_device_ids.len()
    }

    /// Whether this is an accelerator-cluster mesh.
    pub fn is_tpu_mesh(&self) -> bool {
        self.device_type == DeviceType::Tpu
    }

    /// Whether this is a host mesh.
    pub fn is_cpu_mesh(&self) -> bool {
        self.device_type == DeviceType::Cpu
    }
}

/// Fully qualified device name, e.g. `/job:localhost/replica:0/task:0/device:GPU:1`.
pub fn device_name(job: &str, task: u32, device_type: DeviceType, index: i64) -> String {
    format!("/job:{job}/replica:0/task:{task}/device:{device_type}:{index}")
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .dims
            .iter()
            .map(|d| format!("{}={}", d.name, d.size))
            .collect();
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.name,
            dims.join(","),
            join(&self.global_device_ids),
            join(&self.local_device_ids),
            self.local_devices.join(","),
        )?;
        if self.local_devices.is_empty() {
            write!(f, "|{}", self.device_type)?;
        }
        Ok(())
    }
}

fn parse_ids(field: &str, input: &str) -> Result<Vec<i64>, MeshError> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(|id| {
            id.trim().parse::<i64>().map_err(|_| MeshError::Malformed {
                what: "mesh device id list",
                input: input.to_string(),
            })
        })
        .collect()
}

impl FromStr for Mesh {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MeshError::Malformed {
            what: "mesh",
            input: s.to_string(),
        };
        let fields: Vec<&str> = s.split('|').collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(malformed());
        }
        let mut dims = Vec::new();
        for dim in fields[1].split(',').filter(|d| !d.is_empty()) {
            let (name, size) = dim.split_once('=').ok_or_else(malformed)?;
            let size = size.parse::<i64>().map_err(|_| malformed())?;
            dims.push(MeshDimension::new(name, size));
        }
        let global = parse_ids(fields[2], s)?;
        let local = parse_ids(fields[3], s)?;
        let devices: Vec<String> = fields[4]
            .split(',')
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        match fields.get(5) {
            Some(ty) => Mesh::with_device_type(fields[0], ty.parse()?, dims, global, local, devices),
            None => Mesh::new(fields[0], dims, global, local, devices),
        }
    }
}

impl TryFrom<String> for Mesh {
    type Error = MeshError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Mesh> for String {
    fn from(mesh: Mesh) -> Self {
        mesh.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_host_tpu_mesh() -> Mesh {
        // Eight TPU cores across two hosts; this process owns cores 4..8.
        let devices = (0..4).map(|i| device_name("worker", 1, DeviceType::Tpu, i)).collect();
        Mesh::new(
            "tpu_mesh",
            vec![MeshDimension::new("x", 8)],
            (0..8).collect(),
            vec![4, 5, 6, 7],
            devices,
        )
        .unwrap()
    }

    #[test]
    fn device_type_from_device_name() {
        assert_eq!(
            DeviceType::from_device_name("/job:localhost/replica:0/task:0/device:GPU:1").unwrap(),
            DeviceType::Gpu
        );
        assert!(DeviceType::from_device_name("/job:localhost/cpu0").is_err());
    }

    #[test]
    fn local_mesh_queries() {
        let mesh = Mesh::local("cpu", DeviceType::Cpu, "x", 2).unwrap();
        assert!(mesh.is_cpu_mesh());
        assert!(!mesh.is_tpu_mesh());
        assert_eq!(mesh.num_devices(), 2);
        assert_eq!(mesh.local_device_ids(), &[0, 1]);
        assert_eq!(
            mesh.local_devices()[1],
            "/job:localhost/replica:0/task:0/device:CPU:1"
        );
        assert_eq!(mesh.dim_size("x"), Some(2));
        assert_eq!(mesh.dim_size("y"), None);
    }

    #[test]
    fn multi_host_mesh_has_partial_local_slice() {
        let mesh = two_host_tpu_mesh();
        assert!(mesh.is_tpu_mesh());
        assert_eq!(mesh.num_devices(), 8);
        assert_eq!(mesh.num_local_devices(), 4);
    }

    #[test]
    fn mesh_string_round_trip() {
        let mesh = two_host_tpu_mesh();
        let text = mesh.to_string();
        assert!(text.starts_with("tpu_mesh|x=8|0,1,2,3,4,5,6,7|4,5,6,7|/job:worker"));
        assert_eq!(text.parse::<Mesh>().unwrap(), mesh);
    }

    #[test]
    fn remote_only_mesh_keeps_device_type() {
        let mesh = Mesh::with_device_type(
            "remote",
            DeviceType::Tpu,
            vec![MeshDimension::new("x", 4)],
            vec![0, 1, 2, 3],
            vec![],
            vec![],
        )
        .unwrap();
        assert_eq!(mesh.to_string(), "remote|x=4|0,1,2,3|||TPU");
        assert_eq!("remote|x=4|0,1,2,3|||TPU".parse::<Mesh>().unwrap(), mesh);
    }

    #[test]
    fn mesh_rejects_inconsistent_devices() {
        let err = Mesh::with_device_type(
            "m",
            DeviceType::Cpu,
            vec![MeshDimension::new("x", 2)],
            vec![0, 1],
            vec![3],
            vec![device_name("localhost", 0, DeviceType::Cpu, 3)],
        )
        .unwrap_err();
        assert_eq!(err, MeshError::UnknownLocalDevice { id: 3, mesh: "m".into() });

        let err = Mesh::with_device_type(
            "m",
            DeviceType::Cpu,
            vec![MeshDimension::new("x", 4)],
            vec![0, 1],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::DeviceCountMismatch { dims_product: 4, .. }));

        let err = Mesh::with_device_type(
            "m",
            DeviceType::Cpu,
            vec![MeshDimension::new("x", 1)],
            vec![0],
            vec![0],
            vec![device_name("localhost", 0, DeviceType::Gpu, 0)],
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::MixedDeviceTypes { .. }));
    }

    #[test]
    fn mesh_rejects_non_positive_dimensions() {
        let err = Mesh::with_device_type(
            "zero",
            DeviceType::Gpu,
            vec![MeshDimension::new("x", 0)],
            vec![],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert_eq!(
            err,
            MeshError::NonPositiveDimension {
                mesh: "zero".into(),
                dim: "x".into(),
                size: 0,
            }
        );

        // The product of two negative sizes still matches the device count.
        let err = Mesh::with_device_type(
            "negative",
            DeviceType::Gpu,
            vec![MeshDimension::new("x", -2), MeshDimension::new("y", -1)],
            vec![0, 1],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::NonPositiveDimension { size: -2, .. }));

        assert!("zero|x=0||||GPU".parse::<Mesh>().is_err());
        assert!(Mesh::local("empty", DeviceType::Cpu, "x", 0).is_err());
    }

    #[test]
    fn mesh_serializes_as_string() {
        let mesh = Mesh::local("gpu", DeviceType::Gpu, "x", 1).unwrap();
        let json = serde_json::to_string(&mesh).unwrap();
        assert_eq!(
            json,
            "\"gpu|x=1|0|0|/job:localhost/replica:0/task:0/device:GPU:0\""
        );
        let back: Mesh = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mesh);
    }
}
