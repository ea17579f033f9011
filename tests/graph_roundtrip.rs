//! Serialize/deserialize round trips over randomly wired object graphs.

use std::collections::{BTreeSet, HashMap};

use asset_graph::{
    deserialize_graph, serialize_graph, FieldData, GraphError, GraphWarning, IdAllocator,
    IdentityRegistry, LoadOptions, Material, ObjectHandle, ObjectId, SceneNode, World,
};

mod common;
use common::world_and_codecs;

/// xorshift64*, so failures reproduce from the seed alone.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

/// Spawns `count` nodes with random children and links, cycles included.
fn random_graph(world: &mut World, rng: &mut Rng, count: usize) -> Vec<ObjectHandle> {
    let handles: Vec<ObjectHandle> = (0..count)
        .map(|index| world.spawn(SceneNode::named(format!("n{index}"))))
        .collect();
    for handle in &handles {
        let fanout = rng.below(4);
        let children: Vec<ObjectHandle> = (0..fanout).map(|_| handles[rng.below(count)]).collect();
        let link = (rng.below(3) == 0).then(|| handles[rng.below(count)]);
        let node = world.get_mut::<SceneNode>(*handle).expect("node");
        node.children = children;
        node.link = link;
    }
    handles
}

fn reachable(world: &World, root: ObjectHandle) -> BTreeSet<ObjectHandle> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(handle) = stack.pop() {
        if !seen.insert(handle) {
            continue;
        }
        let node = world.get::<SceneNode>(handle).expect("node");
        stack.extend(node.children.iter().copied());
        stack.extend(node.link);
    }
    seen
}

#[test]
fn random_graphs_round_trip_with_structure_intact() {
    let (_, codecs) = world_and_codecs();
    for seed in 1..=48u64 {
        let mut rng = Rng(0x5EED_0000 ^ seed);
        let (mut world, _) = world_and_codecs();
        let count = 1 + rng.below(24);
        let handles = random_graph(&mut world, &mut rng, count);
        let root = handles[0];
        let mut identity = IdentityRegistry::new(IdAllocator::sequential());

        let graph = serialize_graph(&world, &codecs, &mut identity, &[root])
            .unwrap_or_else(|err| panic!("seed {seed}: serialize failed: {err}"));
        assert!(graph.is_complete(), "seed {seed}");
        assert!(graph.warnings.is_empty(), "seed {seed}");
        let expected = reachable(&world, root);
        assert_eq!(graph.stream.len(), expected.len(), "seed {seed}");
        assert_eq!(
            graph.handles.iter().copied().collect::<BTreeSet<_>>(),
            expected,
            "seed {seed}"
        );
        assert_eq!(graph.handles.last(), Some(&root), "seed {seed}");
        assert!(graph.stream.external_references().is_empty(), "seed {seed}");

        let (mut target, _) = world_and_codecs();
        let mut fresh = IdentityRegistry::new(IdAllocator::sequential());
        let report = deserialize_graph(
            &mut target,
            &codecs,
            &mut fresh,
            &graph.stream,
            LoadOptions::persistent(),
        )
        .unwrap_or_else(|err| panic!("seed {seed}: deserialize failed: {err}"));
        assert!(report.is_clean(), "seed {seed}");
        assert_eq!(target.len(), expected.len(), "seed {seed}");

        let loaded: HashMap<ObjectHandle, ObjectHandle> = graph
            .handles
            .iter()
            .map(|original| {
                let id = identity.id_of(*original).expect("serialized objects have ids");
                (*original, report.handle(id).expect("every id loads"))
            })
            .collect();
        for (original, copy) in &loaded {
            let before = world.get::<SceneNode>(*original).expect("original");
            let after = target.get::<SceneNode>(*copy).expect("copy");
            assert_eq!(before.name, after.name, "seed {seed}");
            let mapped: Vec<ObjectHandle> =
                before.children.iter().map(|child| loaded[child]).collect();
            assert_eq!(after.children, mapped, "seed {seed}");
            assert_eq!(after.link, before.link.map(|link| loaded[&link]), "seed {seed}");
        }
    }
}

#[test]
fn shared_target_is_written_once_and_reloaded_shared() {
    let (mut world, codecs) = world_and_codecs();
    let stone = world.spawn(Material::named("stone"));
    let root = world.spawn(SceneNode::named("root"));
    let a = world.spawn(SceneNode {
        material: Some(stone),
        ..SceneNode::named("a")
    });
    let b = world.spawn(SceneNode {
        material: Some(stone),
        ..SceneNode::named("b")
    });
    world.get_mut::<SceneNode>(root).expect("root").children = vec![a, b];
    let mut identity = IdentityRegistry::new(IdAllocator::sequential());

    let graph = serialize_graph(&world, &codecs, &mut identity, &[root]).expect("serialize");
    assert_eq!(graph.stream.len(), 4);
    assert_eq!(graph.handles.first(), Some(&stone));

    let (mut target, _) = world_and_codecs();
    let mut fresh = IdentityRegistry::new(IdAllocator::sequential());
    let report = deserialize_graph(
        &mut target,
        &codecs,
        &mut fresh,
        &graph.stream,
        LoadOptions::persistent(),
    )
    .expect("deserialize");
    let loaded_root = report.root().expect("root");
    let children = target
        .get::<SceneNode>(loaded_root)
        .expect("root")
        .children
        .clone();
    let materials: Vec<Option<ObjectHandle>> = children
        .iter()
        .map(|child| target.get::<SceneNode>(*child).expect("child").material)
        .collect();
    assert_eq!(materials.len(), 2);
    assert!(materials[0].is_some());
    assert_eq!(materials[0], materials[1]);
}

#[test]
fn external_reference_without_a_provider_loads_as_null() {
    let (mut world, codecs) = world_and_codecs();
    let root = world.spawn(SceneNode::named("root"));
    let mut identity = IdentityRegistry::new(IdAllocator::sequential());
    let mut graph = serialize_graph(&world, &codecs, &mut identity, &[root]).expect("serialize");
    let ghost = ObjectId::from_u128(0xDEAD);
    let root_id = graph.stream.roots[0];
    graph
        .stream
        .get_mut(root_id)
        .expect("root record")
        .set(asset_graph::node_fields::LINK, FieldData::Ref(Some(ghost)));

    let (mut target, _) = world_and_codecs();
    let mut fresh = IdentityRegistry::new(IdAllocator::sequential());
    let report = deserialize_graph(
        &mut target,
        &codecs,
        &mut fresh,
        &graph.stream,
        LoadOptions::persistent(),
    )
    .expect("dangling references do not fail the load");
    assert!(!report.is_clean());
    assert!(report.dangling.iter().any(|warning| matches!(
        warning,
        GraphWarning::Dangling { target, .. } if *target == ghost
    )));
    let loaded = report.root().expect("root");
    assert_eq!(target.get::<SceneNode>(loaded).expect("root").link, None);
}

#[test]
fn root_without_codec_fails_the_whole_call() {
    let (_, codecs) = world_and_codecs();
    let mut bare = World::new();
    let root = bare.spawn(SceneNode::named("root"));
    let mut identity = IdentityRegistry::new(IdAllocator::sequential());
    let empty = asset_graph::CodecRegistry::new();

    assert!(matches!(
        serialize_graph(&bare, &empty, &mut identity, &[root]),
        Err(GraphError::MissingCodec(_))
    ));
    assert!(serialize_graph(&bare, &codecs, &mut identity, &[root]).is_ok());
}
