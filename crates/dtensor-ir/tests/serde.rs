//! JSON interchange of whole modules.

use dtensor_common::{DeviceType, Layout, Mesh};
use dtensor_ir::{Attribute, ElementType, Module, OpKind, TensorType, Visibility, LAYOUT_ATTR};

fn sample_module() -> Module {
    let mesh = Mesh::local("gpu", DeviceType::Gpu, "x", 2).unwrap();
    let layout = Layout::replicated(mesh.clone(), 1);
    let ty = TensorType::new(ElementType::F32, [4]);
    let mut module = Module::new("sample");

    let f = module.add_function(
        "main",
        vec![TensorType::scalar(ElementType::I32)],
        vec![ty.clone()],
        Visibility::Public,
    );
    let entry = module.function(f).entry;
    let (_, body) = module.push_cluster(entry, Some(mesh));
    let recv = module.push_op(
        body,
        OpKind::DTensorRecv {
            key: "k".into(),
            layout: layout.clone(),
        },
        vec![],
        vec![ty],
    );
    module.set_op_attr(recv, LAYOUT_ATTR, Attribute::Str(layout.to_string()));
    let value = module.result(recv, 0);
    module.push_op(entry, OpKind::Return, vec![value], vec![]);
    module
}

#[test]
fn test_module_survives_json() {
    let module = sample_module();
    let json = serde_json::to_string(&module).unwrap();
    let back: Module = serde_json::from_str(&json).unwrap();
    assert_eq!(back, module);
    assert_eq!(back.to_string(), module.to_string());
    assert!(back.lookup_function("main").is_some());
}

#[test]
fn test_layouts_serialize_as_strings() {
    let json = serde_json::to_value(sample_module()).unwrap();
    let text = json.to_string();
    assert!(
        text.contains("\"sharding_specs:unsharded, mesh:gpu|x=2|0,1|0,1|"),
        "{text}"
    );
}

#[test]
fn test_erased_ops_stay_erased() {
    let mut module = sample_module();
    let f = module.lookup_function("main").unwrap();
    let ops = module.function_ops(f);
    let recv = ops
        .into_iter()
        .find(|&op| module.op(op).kind.is_abstract_transfer())
        .unwrap();
    module.erase_op(recv);

    let back: Module = serde_json::from_str(&serde_json::to_string(&module).unwrap()).unwrap();
    assert_eq!(back.count_ops(OpKind::is_abstract_transfer), 0);
    assert!(!back.op(recv).is_live());
}
