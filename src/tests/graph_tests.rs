use super::*;
use crate::codec::{FieldData, Record, Value};
use crate::error::GraphError;
use crate::host::{LiveObject, World};
use crate::id::IdAllocator;
use crate::scene::{
    node_fields, register_scene_types, Material, SceneNode, SCENE_NODE_TYPE,
};

#[derive(Debug, Default)]
struct Orphan;

impl LiveObject for Orphan {
    fn type_name(&self) -> &'static str {
        "test.orphan"
    }

    crate::live_object_any!();
}

fn setup() -> (World, CodecRegistry, IdentityRegistry) {
    let mut world = World::new();
    let mut codecs = CodecRegistry::new();
    register_scene_types(&mut world, &mut codecs).expect("scene types should register");
    (world, codecs, IdentityRegistry::new(IdAllocator::sequential()))
}

fn node(world: &World, handle: ObjectHandle) -> &SceneNode {
    world.get::<SceneNode>(handle).expect("node should exist")
}

/// Builds R -> C1 -> C2 -> R through child lists.
fn cycle(world: &mut World) -> (ObjectHandle, ObjectHandle, ObjectHandle) {
    let root = world.spawn(SceneNode::named("R"));
    let c1 = world.spawn(SceneNode::named("C1"));
    let c2 = world.spawn(SceneNode::named("C2"));
    world.get_mut::<SceneNode>(root).expect("root").children = vec![c1];
    world.get_mut::<SceneNode>(c1).expect("c1").children = vec![c2];
    world.get_mut::<SceneNode>(c2).expect("c2").children = vec![root];
    (root, c1, c2)
}

#[test]
fn cycle_is_emitted_once_per_object_in_post_order() {
    let (mut world, codecs, mut identity) = setup();
    let (root, c1, c2) = cycle(&mut world);

    let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
        .expect("cycle should serialize");
    assert!(graph.is_complete());
    assert_eq!(graph.stream.len(), 3);
    assert_eq!(graph.handles, vec![c2, c1, root]);

    let root_id = identity.id_of(root).expect("root should have an id");
    assert_eq!(graph.stream.roots, vec![root_id]);
    let c2_record = graph.stream.entries[0].record.clone();
    assert_eq!(
        c2_record.get(node_fields::CHILDREN),
        Some(&FieldData::Refs(vec![root_id]))
    );
}

#[test]
fn cycle_reloads_with_back_patched_references() {
    let (mut world, codecs, mut identity) = setup();
    let (root, _, _) = cycle(&mut world);
    let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
        .expect("cycle should serialize");

    let (mut target, _, mut fresh) = setup();
    let report = deserialize_graph(
        &mut target,
        &codecs,
        &mut fresh,
        &graph.stream,
        LoadOptions::persistent(),
    )
    .expect("cycle should load");
    assert!(report.is_clean());
    assert_eq!(target.len(), 3);

    let new_root = report.root().expect("root should load");
    let new_c1 = node(&target, new_root).children[0];
    let new_c2 = node(&target, new_c1).children[0];
    assert_eq!(node(&target, new_c2).children, vec![new_root]);
    assert_eq!(node(&target, new_c2).name, "C2");
    assert_eq!(fresh.id_of(new_root), identity.id_of(root));
}

#[test]
fn shared_targets_are_emitted_once() {
    let (mut world, codecs, mut identity) = setup();
    let material = world.spawn(Material::named("stone"));
    let a = world.spawn(SceneNode {
        material: Some(material),
        ..SceneNode::named("a")
    });
    let b = world.spawn(SceneNode {
        material: Some(material),
        link: Some(a),
        ..SceneNode::named("b")
    });
    let root = world.spawn(SceneNode {
        children: vec![a, b],
        ..SceneNode::named("root")
    });

    let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
        .expect("graph should serialize");
    assert_eq!(graph.stream.len(), 4);
    assert_eq!(graph.handles, vec![material, a, b, root]);
}

#[test]
fn missing_codec_on_child_degrades_to_null() {
    let (mut world, codecs, mut identity) = setup();
    let orphan = world.spawn(Orphan);
    let root = world.spawn(SceneNode {
        link: Some(orphan),
        ..SceneNode::named("root")
    });

    let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
        .expect("graph should serialize");
    assert_eq!(graph.stream.len(), 1);
    assert_eq!(
        graph.warnings,
        vec![GraphWarning::MissingCodec {
            handle: orphan,
            type_name: "test.orphan".to_string(),
        }]
    );
    assert_eq!(
        graph.stream.entries[0].record.get(node_fields::LINK),
        Some(&FieldData::Ref(None))
    );
}

#[test]
fn missing_codec_on_root_fails_the_walk() {
    let (mut world, codecs, mut identity) = setup();
    let orphan = world.spawn(Orphan);
    let err = serialize_graph(&world, &codecs, &mut identity, &[orphan])
        .expect_err("root without codec should fail");
    assert!(matches!(err, GraphError::MissingCodec(name) if name == "test.orphan"));
}

#[test]
fn failed_entry_leaves_dangling_references() {
    let (mut world, codecs, mut identity) = setup();
    let lost = ObjectId::from_u128(1);
    let root = ObjectId::from_u128(2);
    let mut stream = RecordStream::new();
    stream.push(lost, Record::new("test.orphan", 1));
    stream.push(
        root,
        Record::new(SCENE_NODE_TYPE, 1)
            .with(0, Value::from("root"))
            .with(2, FieldData::Refs(vec![lost])),
    );
    stream.roots.push(root);

    let report = deserialize_graph(
        &mut world,
        &codecs,
        &mut identity,
        &stream,
        LoadOptions::persistent(),
    )
    .expect("root should still load");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        report.dangling,
        vec![GraphWarning::Dangling {
            owner: root,
            field: node_fields::CHILDREN,
            target: lost,
        }]
    );
    let handle = report.root().expect("root should load");
    assert!(node(&world, handle).children.is_empty());
    assert_eq!(world.len(), 1);
}

#[test]
fn loader_steps_and_abandon_undoes_partial_work() {
    let (mut world, codecs, mut identity) = setup();
    let (root, _, _) = cycle(&mut world);
    let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
        .expect("cycle should serialize");

    let (mut target, _, mut fresh) = setup();
    let mut loader = GraphLoader::new(&graph.stream, LoadOptions::persistent());
    let progress = loader
        .step(&mut target, &codecs, &mut fresh)
        .expect("first step should succeed");
    assert_eq!(progress, LoadProgress::Pending { loaded: 1, total: 3 });
    assert!(!loader.is_complete());
    assert_eq!(target.len(), 1);
    assert_eq!(fresh.len(), 1);

    loader.abandon(&mut target, &mut fresh);
    assert!(target.is_empty());
    assert!(fresh.is_empty());
}

#[test]
fn ephemeral_binding_reports_stream_ids_only() {
    let (mut world, codecs, mut identity) = setup();
    let (root, _, _) = cycle(&mut world);
    let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
        .expect("cycle should serialize");
    let root_id = identity.id_of(root).expect("root should have an id");

    let (mut target, _, mut fresh) = setup();
    let report = deserialize_graph(
        &mut target,
        &codecs,
        &mut fresh,
        &graph.stream,
        LoadOptions::ephemeral(),
    )
    .expect("cycle should load");
    let new_root = report.handle(root_id).expect("root should be reported");
    assert!(fresh
        .id_of(new_root)
        .is_some_and(|id| id.is_ephemeral()));
    assert!(!fresh.contains_id(root_id));
}
