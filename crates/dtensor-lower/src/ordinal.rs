//! Device-ordinal resolution.
//!
//! A per-device function only sees its global device id (parameter 0). The
//! transfer primitives want the device's rank among the mesh's local
//! devices, so we bake an id -> ordinal table into the function and index it
//! at runtime.

use dtensor_common::{LowerError, Mesh};
use dtensor_ir::{ElementType, Emitter, FuncId, OpKind, TensorType, ValueId};
use tracing::trace;

/// Integer width of the emitted ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrdinalWidth {
    #[default]
    I32,
    I64,
}

/// Table mapping each global device id of `mesh` to its local ordinal.
///
/// Entries for devices that are not local to this process stay 0.
pub fn ordinal_table(mesh: &Mesh) -> Vec<i32> {
    let mut table = vec![0i32; mesh.num_devices()];
    for (ordinal, &id) in mesh.local_device_ids().iter().enumerate() {
        // Mesh construction guarantees 0 <= id < num_devices.
        table[id as usize] = ordinal as i32;
    }
    table
}

/// Emit ops computing the local ordinal of the device running `function`.
///
/// The sequence is a table constant, the device id reshaped to `[1]`, a
/// one-element slice of the table at that offset, and a reshape back to a
/// scalar, followed by a cast when `width` is [`OrdinalWidth::I64`].
pub fn device_ordinal(
    emitter: &mut Emitter<'_>,
    mesh: &Mesh,
    function: FuncId,
    width: OrdinalWidth,
) -> Result<ValueId, LowerError> {
    let device_id = emitter.module().device_id(function)?;
    let table = ordinal_table(mesh);
    trace!(mesh = mesh.name(), ?table, "device ordinal table");

    let len = table.len() as i64;
    let table = emitter.const_i32(table, vec![len]);
    let offset = emitter.reshape(device_id, vec![1]);
    let size = emitter.const_i32(vec![1], vec![1]);
    let slice = emitter.emit_value(
        OpKind::Slice,
        vec![table, offset, size],
        TensorType::new(ElementType::I32, [1]),
    );
    let ordinal = emitter.reshape(slice, vec![]);
    Ok(match width {
        OrdinalWidth::I32 => ordinal,
        OrdinalWidth::I64 => emitter.cast(ordinal, ElementType::I64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtensor_common::{DeviceType, MeshDimension};

    #[test]
    fn table_inverts_local_device_ids() {
        let devices = ["CPU:3", "CPU:1"]
            .iter()
            .map(|d| format!("/job:localhost/replica:0/task:0/device:{d}"))
            .collect();
        let mesh = Mesh::new(
            "cpu",
            vec![MeshDimension::new("x", 4)],
            vec![0, 1, 2, 3],
            vec![3, 1],
            devices,
        )
        .unwrap();
        assert_eq!(ordinal_table(&mesh), vec![0, 1, 0, 0]);
    }

    #[test]
    fn single_device_table() {
        let mesh = Mesh::local("cpu", DeviceType::Cpu, "x", 1).unwrap();
        assert_eq!(ordinal_table(&mesh), vec![0]);
    }
}
