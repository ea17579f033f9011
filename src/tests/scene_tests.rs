use super::*;
use crate::codec::FieldData;
use crate::error::GraphError;
use crate::id::{IdAllocator, ObjectId};
use crate::identity::IdentityRegistry;
use crate::import::Imports;

#[test]
fn node_fields_roundtrip_through_the_codec() {
    let codec = SceneNodeCodec::new().expect("codec should build");
    let mut node = SceneNode::named("node");
    let source = SceneNode {
        position: [1.0, -2.5, 3.0],
        visible: false,
        tags: vec!["tree".to_string(), "large".to_string()],
        ..SceneNode::named("source")
    };

    for field in codec.descriptor().value_fields() {
        let slot = codec.read(&source, field.index).expect("field should read");
        codec
            .write(&mut node, field.index, slot)
            .expect("field should write");
    }
    assert_eq!(node.name, "source");
    assert_eq!(node.position, [1.0, -2.5, 3.0]);
    assert!(!node.visible);
    assert_eq!(node.tags, vec!["tree", "large"]);
}

#[test]
fn codec_rejects_bad_values_and_foreign_objects() {
    let codec = SceneNodeCodec::new().expect("codec should build");
    let mut node = SceneNode::default();

    let err = codec
        .write(
            &mut node,
            node_fields::POSITION,
            Slot::Value(Value::List(vec![Value::Float(1.0)])),
        )
        .expect_err("short vector should be rejected");
    assert!(matches!(err, CodecError::InvalidValue { .. }));

    let err = codec
        .write(&mut node, node_fields::NAME, Slot::Ref(None))
        .expect_err("reference into a value field should be rejected");
    assert!(matches!(err, CodecError::KindMismatch { .. }));

    let err = codec
        .write(&mut node, FieldIndex::new(42), Slot::Ref(None))
        .expect_err("unknown field should be rejected");
    assert!(matches!(err, CodecError::UnknownField { .. }));

    let material = Material::named("stone");
    let err = codec
        .read(&material, node_fields::NAME)
        .expect_err("material is not a node");
    assert!(matches!(err, CodecError::WrongType { .. }));
}

#[test]
fn integer_components_widen_to_floats() {
    let codec = MaterialCodec::new().expect("codec should build");
    let mut material = Material::default();
    codec
        .write(
            &mut material,
            material_fields::COLOR,
            Slot::Value(Value::List(vec![
                Value::Int(1),
                Value::Float(0.5),
                Value::Int(0),
                Value::Float(1.0),
            ])),
        )
        .expect("color should write");
    assert_eq!(material.color, [1.0, 0.5, 0.0, 1.0]);
}

#[test]
fn registration_is_refused_twice() {
    let mut world = World::new();
    let mut codecs = CodecRegistry::new();
    register_scene_types(&mut world, &mut codecs).expect("first registration should succeed");
    assert!(world.has_factory(SCENE_NODE_TYPE));
    assert!(world.has_factory(MATERIAL_TYPE));
    assert!(matches!(
        register_scene_types(&mut world, &mut codecs),
        Err(GraphError::DuplicateCodec(_))
    ));
}

#[test]
fn material_importer_builds_named_materials_once() {
    let mut world = World::new();
    let mut codecs = CodecRegistry::new();
    register_scene_types(&mut world, &mut codecs).expect("scene types should register");
    let mut identity = IdentityRegistry::new(IdAllocator::sequential());
    let mut imports = Imports::new();
    imports.register(MaterialImporter::default());

    let (id, handle) = imports
        .import("material:bark", &mut world, &mut identity)
        .expect("import should succeed");
    assert_eq!(id, ObjectId::from_import_key("material:bark"));
    assert_eq!(identity.resolve(id), Some(handle));
    assert_eq!(
        world.get::<Material>(handle).map(|m| m.name.as_str()),
        Some("bark")
    );

    let (again, same) = imports
        .import("material:bark", &mut world, &mut identity)
        .expect("second import should reuse the object");
    assert_eq!((again, same), (id, handle));
    assert_eq!(world.len(), 1);

    assert!(matches!(
        imports.import("material:", &mut world, &mut identity),
        Err(GraphError::Import(ImportError::Failed { .. }))
    ));
    assert!(matches!(
        imports.import("mesh:rock", &mut world, &mut identity),
        Err(GraphError::Import(ImportError::NoImporter(_)))
    ));

    assert!(imports.release(id, &mut world, &mut identity));
    assert!(world.is_empty());
    assert!(!identity.contains_id(id));
}

#[test]
fn encoded_node_names_its_material() {
    let mut world = World::new();
    let mut codecs = CodecRegistry::new();
    register_scene_types(&mut world, &mut codecs).expect("scene types should register");
    let material = world.spawn(Material::named("stone"));
    let node = world.spawn(SceneNode {
        material: Some(material),
        ..SceneNode::named("rock")
    });
    let material_id = ObjectId::from_u128(3);
    let mut resolver = |handle: ObjectHandle| (handle == material).then_some(material_id);
    let encoded = codecs
        .encode(&world, node, &mut resolver)
        .expect("node should encode");
    assert_eq!(
        encoded.record.get(node_fields::MATERIAL),
        Some(&FieldData::Ref(Some(material_id)))
    );
    assert!(encoded.unresolved.is_empty());
}
