#![allow(dead_code)]

use asset_graph::{
    register_scene_types, AllocatorKind, BlobStore, CodecRegistry, InstanceId, MaterialImporter,
    MemoryStore, ObjectHandle, ObjectId, Project, ProjectConfig, SceneNode, World,
};

pub type MemoryProject = Project<World, MemoryStore>;

/// Deterministic configuration: sequential ids, lenient references.
pub fn test_config() -> ProjectConfig {
    let mut config = ProjectConfig::new("fixture");
    config.identity.allocator = AllocatorKind::Sequential;
    config
}

pub fn world_and_codecs() -> (World, CodecRegistry) {
    let mut world = World::new();
    let mut codecs = CodecRegistry::new();
    register_scene_types(&mut world, &mut codecs).expect("scene types should register");
    (world, codecs)
}

/// Opens a project over `store` in a fresh world.
pub fn open_project<S: BlobStore>(store: S, config: ProjectConfig) -> Project<World, S> {
    let (world, codecs) = world_and_codecs();
    let mut project = Project::open(world, store, codecs, config).expect("project should open");
    project.register_importer(MaterialImporter::default());
    project
}

pub fn memory_project() -> MemoryProject {
    open_project(MemoryStore::new(), test_config())
}

/// Closes a project and reopens its store in a new world, as a new session
/// would.
pub fn reopen(project: MemoryProject) -> MemoryProject {
    let config = project.config().clone();
    let (_, store) = project.close();
    open_project(store, config)
}

pub fn node<S: BlobStore>(project: &Project<World, S>, handle: ObjectHandle) -> &SceneNode {
    project
        .host()
        .get::<SceneNode>(handle)
        .expect("node should exist")
}

pub fn node_mut<S: BlobStore>(
    project: &mut Project<World, S>,
    handle: ObjectHandle,
) -> &mut SceneNode {
    project
        .host_mut()
        .get_mut::<SceneNode>(handle)
        .expect("node should exist")
}

/// Handles of a spawned `root -> (left, right)` scene.
#[derive(Clone, Copy, Debug)]
pub struct Scene {
    pub root: ObjectHandle,
    pub left: ObjectHandle,
    pub right: ObjectHandle,
}

pub fn spawn_scene<S: BlobStore>(project: &mut Project<World, S>) -> Scene {
    let world = project.host_mut();
    let root = world.spawn(SceneNode::named("root"));
    let left = world.spawn(SceneNode {
        parent: Some(root),
        position: [-1.0, 0.0, 0.0],
        ..SceneNode::named("left")
    });
    let right = world.spawn(SceneNode {
        parent: Some(root),
        position: [1.0, 0.0, 0.0],
        ..SceneNode::named("right")
    });
    world
        .get_mut::<SceneNode>(root)
        .expect("root should exist")
        .children = vec![left, right];
    Scene { root, left, right }
}

/// Spawns the fixture scene and saves it as a graph asset.
pub fn scene_asset<S: BlobStore>(project: &mut Project<World, S>, name: &str) -> (ObjectId, Scene) {
    let scene = spawn_scene(project);
    let id = project
        .create_asset(scene.root, name)
        .expect("asset should be created");
    (id, scene)
}

/// Live handle of a named part of an instance.
pub fn part<S: BlobStore>(
    project: &Project<World, S>,
    instance: InstanceId,
    path: &str,
) -> ObjectHandle {
    project
        .find_part(instance, path)
        .expect("instance should exist")
        .expect("part should exist")
}

/// Renames a live instance object and reports the change.
pub fn rename<S: BlobStore>(
    project: &mut Project<World, S>,
    handle: ObjectHandle,
    name: &str,
) {
    node_mut(project, handle).name = name.to_string();
    project.mark_dirty(handle).expect("object should be tracked");
}
