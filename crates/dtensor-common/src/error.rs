use thiserror::Error;

/// Error reported by every lowering entry point.
///
/// Lowering failures are never retried: the error aborts lowering of one
/// send/receive pair and propagates to the pipeline driver.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum LowerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LowerError {
    /// Create an invalid-argument error from any message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// The message carried by this error, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(message) => message,
        }
    }
}

/// Error produced while constructing or parsing a [`crate::Mesh`] or
/// [`crate::Layout`].
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum MeshError {
    #[error("mesh '{mesh}' has non-positive size {size} for dimension '{dim}'")]
    NonPositiveDimension { mesh: String, dim: String, size: i64 },

    #[error("mesh dimensions have {dims_product} devices but {global_count} global device ids were given")]
    DeviceCountMismatch { dims_product: i64, global_count: usize },

    #[error("global device id {id} is out of range for a mesh with {num_devices} devices")]
    DeviceIdOutOfRange { id: i64, num_devices: usize },

    #[error("local device id {id} is not a global device id of mesh '{mesh}'")]
    UnknownLocalDevice { id: i64, mesh: String },

    #[error("mesh '{mesh}' has {ids} local device ids but {names} local device names")]
    LocalDeviceNameMismatch { mesh: String, ids: usize, names: usize },

    #[error("cannot determine device type of '{device}'")]
    UnknownDeviceType { device: String },

    #[error("mesh '{mesh}' mixes device types {first} and {second}")]
    MixedDeviceTypes { mesh: String, first: String, second: String },

    #[error("layout shards on unknown mesh dimension '{dim}'")]
    UnknownMeshDimension { dim: String },

    #[error("dimension {dim} of size {size} does not split evenly into {shards} shards")]
    UnevenSharding { dim: usize, size: i64, shards: i64 },

    #[error("malformed {what}: {input}")]
    Malformed { what: &'static str, input: String },
}

impl From<MeshError> for LowerError {
    fn from(err: MeshError) -> Self {
        LowerError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_error_display() {
        let err = LowerError::invalid_argument("DTensorSend is not inside a cluster");
        assert_eq!(
            err.to_string(),
            "invalid argument: DTensorSend is not inside a cluster"
        );
        assert_eq!(err.message(), "DTensorSend is not inside a cluster");
    }

    #[test]
    fn mesh_error_converts_to_invalid_argument() {
        let err: LowerError = MeshError::UnknownMeshDimension { dim: "y".into() }.into();
        assert_eq!(
            err,
            LowerError::InvalidArgument("layout shards on unknown mesh dimension 'y'".into())
        );
    }
}
