//! Integration tests for device-ordinal resolution.
//!
//! The emitted op sequence is executed with the reference interpreter for
//! every local device of the mesh.

mod common;

use common::{i32_scalar, mesh, partial_mesh};
use dtensor_common::{DeviceType, Mesh};
use dtensor_ir::{
    ElementType, Emitter, InsertPoint, Module, OpKind, Rewrite, TensorType, Visibility,
};
use dtensor_lower::ordinal::{device_ordinal, ordinal_table, OrdinalWidth};
use dtensor_sim::{Interpreter, Tensor};

// ── Helpers ────────────────────────────────────────────────────────────

/// `@main(%device_id) -> ordinal` computing the ordinal on `mesh`.
fn ordinal_module(mesh: &Mesh, width: OrdinalWidth) -> Module {
    let result = match width {
        OrdinalWidth::I32 => i32_scalar(),
        OrdinalWidth::I64 => TensorType::scalar(ElementType::I64),
    };
    let mut module = Module::new("m");
    let main = module.add_function("main", vec![i32_scalar()], vec![result], Visibility::Public);
    let entry = module.function(main).entry;

    let mut rewrite = Rewrite::new();
    let mut emitter = Emitter::new(&mut module, &mut rewrite, InsertPoint::BlockEnd(entry));
    let ordinal = device_ordinal(&mut emitter, mesh, main, width).unwrap();
    emitter.emit(OpKind::Return, vec![ordinal], vec![]);
    rewrite.apply(&mut module);
    module
}

// ── Tests ──────────────────────────────────────────────────────────────

#[test]
fn test_ordinal_of_every_local_device() {
    let mesh = partial_mesh("gpu", DeviceType::Gpu, 6, &[4, 1, 5]);
    let table = ordinal_table(&mesh);
    let module = ordinal_module(&mesh, OrdinalWidth::I32);
    let mut sim = Interpreter::new();

    for (ordinal, &id) in mesh.local_device_ids().iter().enumerate() {
        assert_eq!(table[id as usize], ordinal as i32);
        let result = sim.run(&module, "main", id as i32, vec![]).unwrap();
        assert_eq!(result, vec![Tensor::scalar_i32(ordinal as i32)], "device {id}");
    }
}

#[test]
fn test_ordinal_widened_to_i64() {
    let mesh = mesh("cpu", DeviceType::Cpu, 3);
    let module = ordinal_module(&mesh, OrdinalWidth::I64);
    let result = Interpreter::new().run(&module, "main", 2, vec![]).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].ty(), TensorType::scalar(ElementType::I64));
    assert_eq!(result[0].as_index().unwrap(), 2);
}

#[test]
fn test_ordinal_op_sequence() {
    let mesh = mesh("gpu", DeviceType::Gpu, 2);
    let module = ordinal_module(&mesh, OrdinalWidth::I32);
    insta::assert_snapshot!(module.to_string(), @r###"
    module @m {
      func @main(%0: tensor<i32>) -> (tensor<i32>) {
        %1 = tf.Const() {value = dense<[0, 1]>} : tensor<2xi32>
        %2 = tf.Reshape(%0) : tensor<1xi32>
        %3 = tf.Const() {value = dense<[1]>} : tensor<1xi32>
        %4 = tf.Slice(%1, %2, %3) : tensor<1xi32>
        %5 = tf.Reshape(%4) : tensor<i32>
        func.return(%5)
      }
    }
    "###);
}

#[test]
fn test_missing_device_id_is_invalid_argument() {
    let mesh = mesh("cpu", DeviceType::Cpu, 1);
    let mut module = Module::new("m");
    let main = module.add_function("main", vec![], vec![], Visibility::Public);
    let entry = module.function(main).entry;
    let mut rewrite = Rewrite::new();
    let mut emitter = Emitter::new(&mut module, &mut rewrite, InsertPoint::BlockEnd(entry));

    let err = device_ordinal(&mut emitter, &mesh, main, OrdinalWidth::I32).unwrap_err();
    assert_eq!(err.message(), "function @main has no device id argument");
    assert!(rewrite.is_empty());
}

#[test]
fn test_mistyped_device_id_is_invalid_argument() {
    let mesh = mesh("cpu", DeviceType::Cpu, 1);
    let mut module = Module::new("m");
    let main = module.add_function(
        "main",
        vec![TensorType::scalar(ElementType::F32)],
        vec![],
        Visibility::Public,
    );
    let entry = module.function(main).entry;
    let mut rewrite = Rewrite::new();
    let mut emitter = Emitter::new(&mut module, &mut rewrite, InsertPoint::BlockEnd(entry));

    let err = device_ordinal(&mut emitter, &mesh, main, OrdinalWidth::I32).unwrap_err();
    assert_eq!(
        err.message(),
        "device id argument of @main must be tensor<i32>, found tensor<f32>"
    );
}
