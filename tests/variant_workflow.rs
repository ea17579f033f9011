//! End-to-end variant engine workflows over an in-memory project.

use asset_graph::{
    node_fields, AssetKind, BlobStore, ConflictReason, FieldData, GraphError, RevertScope, SceneNode,
    StreamKind,
};

mod common;
use common::{
    memory_project, node, node_mut, open_project, part, rename, reopen, scene_asset, test_config,
};

#[test]
fn collected_overrides_become_a_variant_that_survives_reopen() {
    let mut project = memory_project();
    let (base, scene) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let left = part(&project, instance, "left");
    rename(&mut project, left, "left renamed");

    let collected = project.collect_overrides(instance).expect("collect");
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].field, node_fields::NAME);
    assert_eq!(collected[0].value, FieldData::Value("left renamed".into()));
    assert!(project
        .collect_overrides(instance)
        .expect("nothing dirty")
        .is_empty());

    let variant = project
        .create_variant(instance, "renamed")
        .expect("variant should be created");
    let metadata = project.metadata(variant).expect("metadata");
    assert_eq!(metadata.kind, AssetKind::Variant);
    assert_eq!(metadata.parent, Some(base));
    assert_eq!(
        project.instance(instance).expect("instance").source(),
        variant
    );
    assert_eq!(node(&project, scene.left).name, "left");

    let mut project = reopen(project);
    let copy = project.instantiate(variant).expect("variant instance");
    let left = part(&project, copy, "left renamed");
    let right = part(&project, copy, "right");
    let root = project.instance(copy).expect("instance").root();
    assert!(project
        .instance(copy)
        .expect("instance")
        .overrides()
        .is_empty());

    assert_eq!(node(&project, root).name, "root");
    assert_eq!(node(&project, root).children, vec![left, right]);
    assert_eq!(node(&project, left).parent, Some(root));
    assert_eq!(node(&project, left).position, [-1.0, 0.0, 0.0]);
    assert!(node(&project, left).visible);
    assert_eq!(node(&project, right).name, "right");
    assert_eq!(node(&project, right).position, [1.0, 0.0, 0.0]);
    assert_eq!(node(&project, right).parent, Some(root));

    let renamed = project
        .instance(copy)
        .expect("instance")
        .origin(left)
        .expect("left part");
    let base_records = project.load_chain(base).expect("base chain").effective();
    let variant_records = project
        .load_chain(variant)
        .expect("variant chain")
        .effective();
    assert_eq!(base_records.ids(), variant_records.ids());
    for entry in &base_records.entries {
        let record = variant_records.get(entry.id).expect("variant record");
        for (field, data) in &entry.record.fields {
            if entry.id == renamed && *field == node_fields::NAME {
                assert_eq!(
                    record.get(*field),
                    Some(&FieldData::Value("left renamed".into()))
                );
            } else {
                assert_eq!(record.get(*field), Some(data), "{} field {field}", entry.id);
            }
        }
    }
}

#[test]
fn detached_part_stays_out_of_collected_and_saved_instances() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let root = project.instance(instance).expect("instance").root();
    let left = part(&project, instance, "left");

    project
        .detach_part(instance, left)
        .expect("left should detach");
    node_mut(&mut project, left).name = "loose".to_string();
    assert!(matches!(
        project.mark_dirty(left),
        Err(GraphError::UnknownObject(_))
    ));
    rename(&mut project, root, "root renamed");

    let collected = project.collect_overrides(instance).expect("collect");
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].field, node_fields::NAME);
    let live = project.instance(instance).expect("instance");
    assert_eq!(live.added().count(), 0);
    assert!(live.is_detached_part(left));
    assert_eq!(project.instance_of(left), None);

    let key = project
        .save_instance(instance, "saved")
        .expect("instance should save");
    assert!(project.metadata(key).expect("metadata").parts.is_empty());
    assert_eq!(project.instance_of(left), None);

    let mut project = reopen(project);
    let copy = project.instantiate(key).expect("saved instance");
    let handles = project.instance(copy).expect("instance").handles();
    assert_eq!(handles.len(), 3);
    let named_left = handles
        .iter()
        .filter(|handle| node(&project, **handle).name == "left")
        .count();
    assert_eq!(named_left, 1);
    assert!(project.find_part(copy, "loose").expect("find").is_none());
    let root = project.instance(copy).expect("instance").root();
    assert_eq!(node(&project, root).name, "root renamed");
}

#[test]
fn apply_then_revert_round_trips_through_the_base() {
    let mut project = memory_project();
    let (base, scene) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let left = part(&project, instance, "left");
    rename(&mut project, left, "pushed");

    assert!(project.can_apply_to_base(instance).expect("check"));
    let applied = project
        .apply_changes_to_base(instance)
        .expect("apply should succeed");
    assert_eq!(applied.len(), 1);
    assert!(project
        .instance(instance)
        .expect("instance")
        .overrides()
        .is_empty());
    assert_eq!(node(&project, scene.left).name, "pushed");
    assert!(project
        .apply_changes_to_base(instance)
        .expect("second apply is a no-op")
        .is_empty());

    let fresh = project.instantiate(base).expect("fresh instance");
    assert!(project.find_part(fresh, "pushed").expect("find").is_some());

    let right = part(&project, fresh, "right");
    node_mut(&mut project, right).position = [5.0, 5.0, 5.0];
    project.mark_dirty(right).expect("tracked");
    assert!(project.can_revert_to_base(fresh).expect("check"));
    let reverted = project
        .revert_changes_to_base(fresh, RevertScope::All)
        .expect("revert should succeed");
    assert_eq!(reverted.len(), 1);
    assert_eq!(node(&project, right).position, [1.0, 0.0, 0.0]);
    assert!(!project.can_revert_to_base(fresh).expect("check"));
}

#[test]
fn revert_scope_keeps_unlisted_overrides() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let left = part(&project, instance, "left");
    node_mut(&mut project, left).name = "kept".to_string();
    node_mut(&mut project, left).visible = false;
    project.mark_dirty(left).expect("tracked");
    let collected = project.collect_overrides(instance).expect("collect");
    assert_eq!(collected.len(), 2);

    let visible = collected
        .iter()
        .find(|record| record.field == node_fields::VISIBLE)
        .expect("visibility override")
        .key();
    project
        .revert_changes_to_base(instance, RevertScope::Fields(vec![visible]))
        .expect("revert");
    assert!(node(&project, left).visible);
    assert_eq!(node(&project, left).name, "kept");
    assert_eq!(
        project.instance(instance).expect("instance").overrides().len(),
        1
    );
}

#[test]
fn moved_base_blocks_a_stale_apply() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let first = project.instantiate(base).expect("first");
    let second = project.instantiate(base).expect("second");
    let first_left = part(&project, first, "left");
    let second_left = part(&project, second, "left");
    rename(&mut project, first_left, "one");
    rename(&mut project, second_left, "two");

    project.apply_changes_to_base(first).expect("first apply");
    let conflicts = project.apply_conflicts(second).expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].reason, ConflictReason::BaseMoved);
    assert!(!project.can_apply_to_base(second).expect("check"));

    let before = project.store().read(base, StreamKind::Data).expect("data");
    match project.apply_changes_to_base(second) {
        Err(GraphError::ConflictingOverride { instance, conflicts }) => {
            assert_eq!(instance, second);
            assert_eq!(conflicts.len(), 1);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    assert_eq!(
        project.store().read(base, StreamKind::Data).expect("data"),
        before
    );
}

#[test]
fn saved_sibling_with_other_value_blocks_apply() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let saved = project.instantiate(base).expect("saved instance");
    let saved_left = part(&project, saved, "left");
    rename(&mut project, saved_left, "mine");
    let key = project.save_instance(saved, "placed").expect("save");

    let other = project.instantiate(base).expect("other instance");
    let other_left = part(&project, other, "left");
    rename(&mut project, other_left, "theirs");
    let conflicts = project.apply_conflicts(other).expect("conflicts");
    assert!(conflicts
        .iter()
        .any(|conflict| conflict.reason == ConflictReason::Sibling(key)));

    // The saved instance does not conflict with its own stored overrides.
    assert!(project.can_apply_to_base(saved).expect("check"));
}

#[test]
fn applying_instance_overrides_is_idempotent() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let left = part(&project, instance, "left");
    rename(&mut project, left, "variant left");
    let variant = project.create_variant(instance, "variant").expect("variant");

    let copy = project.instantiate(variant).expect("copy");
    let copy_left = part(&project, copy, "variant left");
    let first = project.apply_instance_overrides(copy).expect("apply");
    let snapshot = node(&project, copy_left).clone();
    let second = project.apply_instance_overrides(copy).expect("apply again");
    assert_eq!(first.applied, second.applied);
    assert!(second.dangling.is_empty());
    assert_eq!(node(&project, copy_left).name, snapshot.name);
    assert_eq!(node(&project, copy_left).children, snapshot.children);
}

#[test]
fn rebase_rejects_cycles_and_accepts_the_root_graph() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let left = part(&project, instance, "left");
    rename(&mut project, left, "v1");
    let v1 = project.create_variant(instance, "v1").expect("v1");
    let right = part(&project, instance, "right");
    rename(&mut project, right, "v2");
    let v2 = project.create_variant(instance, "v2").expect("v2");
    assert_eq!(project.chain_of(v2).expect("chain"), vec![v2, v1, base]);

    match project.rebase_variant(v1, v2) {
        Err(GraphError::CyclicDependency { chain }) => assert_eq!(chain, vec![v1, v2, v1]),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(project.metadata(v1).expect("metadata").parent, Some(base));

    project.rebase_variant(v2, base).expect("rebase onto root");
    assert_eq!(project.chain_of(v2).expect("chain"), vec![v2, base]);
    let copy = project.instantiate(v2).expect("instance of rebased variant");
    assert!(project.find_part(copy, "v2").expect("find").is_some());
}

#[test]
fn saved_instance_keeps_overrides_and_added_objects() {
    let mut project = memory_project();
    let (base, _) = scene_asset(&mut project, "base");
    let instance = project.instantiate(base).expect("instance");
    let root = project.instance(instance).expect("instance").root();
    let left = part(&project, instance, "left");
    rename(&mut project, left, "saved left");

    let extra = project.host_mut().spawn(SceneNode {
        parent: Some(root),
        ..SceneNode::named("extra")
    });
    node_mut(&mut project, root).children.push(extra);
    project.mark_dirty(root).expect("tracked");

    let key = project.save_instance(instance, "placed").expect("save");
    let metadata = project.metadata(key).expect("metadata");
    assert_eq!(metadata.kind, AssetKind::Instance);
    assert_eq!(metadata.parent, Some(base));
    assert_eq!(metadata.parts.len(), 1);
    assert_eq!(project.instance_of(extra), Some(instance));
    assert_eq!(
        project.save_instance(instance, "placed").expect("save again"),
        key
    );

    let mut project = reopen(project);
    let loaded = project.instantiate(key).expect("load saved instance");
    assert_eq!(project.instance(loaded).expect("instance").key(), Some(key));
    assert!(project.find_part(loaded, "saved left").expect("find").is_some());
    let extra = part(&project, loaded, "extra");
    let root = project.instance(loaded).expect("instance").root();
    assert_eq!(node(&project, extra).parent, Some(root));
}

#[test]
fn instances_link_to_other_open_assets() {
    let mut project = memory_project();
    let rock = project.host_mut().spawn(SceneNode::named("rock"));
    let rock_id = project.create_asset(rock, "rock").expect("rock");
    let tree = project.host_mut().spawn(SceneNode {
        link: Some(rock),
        ..SceneNode::named("tree")
    });
    let tree_id = project.create_asset(tree, "tree").expect("tree");

    let mut project = reopen(project);
    let instance = project.instantiate(tree_id).expect("instance");
    let root = project.instance(instance).expect("instance").root();
    assert!(project.is_open(rock_id));
    assert_eq!(node(&project, root).link, project.asset_root(rock_id));
}

fn project_with_missing_dependency(strict: bool) -> (common::MemoryProject, asset_graph::ObjectId) {
    let mut project = memory_project();
    let rock = project.host_mut().spawn(SceneNode::named("rock"));
    let rock_id = project.create_asset(rock, "rock").expect("rock");
    let tree = project.host_mut().spawn(SceneNode {
        link: Some(rock),
        ..SceneNode::named("tree")
    });
    let tree_id = project.create_asset(tree, "tree").expect("tree");

    let (_, mut store) = project.close();
    for kind in StreamKind::ALL {
        store.remove(rock_id, kind).expect("remove");
    }
    let mut config = test_config();
    config.graph.strict_references = strict;
    (open_project(store, config), tree_id)
}

#[test]
fn missing_dependency_loads_as_null_reference() {
    let (mut project, tree) = project_with_missing_dependency(false);
    let root = project.open_asset(tree).expect("lenient open");
    assert_eq!(node(&project, root).link, None);
}

#[test]
fn strict_references_refuse_a_missing_dependency() {
    let (mut project, tree) = project_with_missing_dependency(true);
    assert!(matches!(
        project.open_asset(tree),
        Err(GraphError::DanglingReference { .. })
    ));
    assert!(!project.is_open(tree));
    assert!(project.host().is_empty());
}
