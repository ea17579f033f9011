//! Project context: the explicitly owned home of a host, a blob store and
//! every registry the engine needs.
//!
//! A [`Project`] owns its object host, so all load, save, apply and revert
//! operations take `&mut self` and at most one of them is in flight at a
//! time. Read-only queries take `&self`.
//!
//! # Contracts
//! - **Invariant**: every live part of an open asset is bound to its
//!   persistent part id and listed in `owners`.
//! - **Invariant**: every live object of an attached instance is tracked by
//!   the override tracker under that instance.
//! - **Postcondition**: a failed `open_asset` or `instantiate` leaves no
//!   bindings and no objects behind.

mod instances;
mod variants;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::asset::{AssetData, AssetIndex, AssetKind, AssetMetadata, Delta, ImportRef};
use crate::codec::{CodecRegistry, RecordStream};
use crate::config::ProjectConfig;
use crate::error::{GraphError, GraphResult};
use crate::graph::{
    deserialize_graph, serialize_with, GraphWarning, LoadOptions, LoadReport, Visit, WalkPolicy,
};
use crate::host::{HostError, ObjectHandle, ObjectHost};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;
use crate::import::{Importer, Imports};
use crate::instance::{Instance, InstanceId};
use crate::overrides::OverrideTracker;
use crate::storage::{read_with_recovery, BlobStore, StreamKind};
use crate::variant::Chain;

/// Live objects of one open graph asset.
#[derive(Clone, Debug)]
struct OpenAsset {
    root: ObjectHandle,
    parts: BTreeMap<ObjectId, ObjectHandle>,
}

pub struct Project<H: ObjectHost, S: BlobStore> {
    host: H,
    store: S,
    config: ProjectConfig,
    codecs: CodecRegistry,
    identity: IdentityRegistry,
    tracker: OverrideTracker,
    index: AssetIndex,
    imports: Imports,
    open: BTreeMap<ObjectId, OpenAsset>,
    owners: HashMap<ObjectHandle, ObjectId>,
    loading: BTreeSet<ObjectId>,
    instances: BTreeMap<InstanceId, Instance>,
    next_instance: u64,
}

impl<H: ObjectHost, S: BlobStore> std::fmt::Debug for Project<H, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.config.project.name)
            .field("assets", &self.index.len())
            .field("open", &self.open.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl<H: ObjectHost, S: BlobStore> Project<H, S> {
    /// Opens a project over `store`, indexing the metadata of every asset.
    ///
    /// Codecs are registered up front; the registry is fixed for the
    /// lifetime of the project.
    pub fn open(
        host: H,
        store: S,
        codecs: CodecRegistry,
        config: ProjectConfig,
    ) -> GraphResult<Self> {
        let mut index = AssetIndex::new();
        for id in store.list(StreamKind::Metadata)? {
            let metadata = AssetMetadata::from_json(&store.read(id, StreamKind::Metadata)?)?;
            index.insert(metadata);
        }
        info!(
            project = %config.project.name,
            assets = index.len(),
            codecs = codecs.type_names().len(),
            "opened project"
        );
        let mut allocator = config.identity.allocator();
        allocator.skip_past(
            index
                .iter()
                .flat_map(|asset| std::iter::once(asset.id).chain(asset.parts.iter().copied())),
        );
        Ok(Self {
            host,
            store,
            identity: IdentityRegistry::new(allocator),
            config,
            codecs,
            tracker: OverrideTracker::new(),
            index,
            imports: Imports::new(),
            open: BTreeMap::new(),
            owners: HashMap::new(),
            loading: BTreeSet::new(),
            instances: BTreeMap::new(),
            next_instance: 1,
        })
    }

    /// Closes the project and hands back its host and store.
    ///
    /// Live objects stay in the host; only the project's bookkeeping ends.
    pub fn close(self) -> (H, S) {
        info!(
            project = %self.config.project.name,
            open = self.open.len(),
            instances = self.instances.len(),
            "closed project"
        );
        (self.host, self.store)
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutable host access. Changed instance objects must be reported with
    /// [`mark_dirty`](Self::mark_dirty).
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    pub fn tracker(&self) -> &OverrideTracker {
        &self.tracker
    }

    pub fn register_importer<I: Importer + 'static>(&mut self, importer: I) {
        self.imports.register(importer);
    }

    /// Imports an external object by key; it becomes usable as a leaf of
    /// any asset graph.
    pub fn import(&mut self, key: &str) -> GraphResult<(ObjectId, ObjectHandle)> {
        self.imports.import(key, &mut self.host, &mut self.identity)
    }

    /// Releases an imported object. Assets referencing it keep its id and
    /// re-import it the next time they load.
    pub fn release_import(&mut self, key: &str) -> bool {
        self.imports.release(
            ObjectId::from_import_key(key),
            &mut self.host,
            &mut self.identity,
        )
    }

    // =========================================================================
    // Asset queries
    // =========================================================================

    pub fn assets(&self) -> impl Iterator<Item = &AssetMetadata> {
        self.index.iter()
    }

    pub fn metadata(&self, id: ObjectId) -> GraphResult<&AssetMetadata> {
        self.index.get(id)
    }

    pub fn dependencies(&self, id: ObjectId) -> GraphResult<&BTreeSet<ObjectId>> {
        Ok(&self.index.get(id)?.dependencies)
    }

    pub fn dependency_closure(&self, id: ObjectId) -> GraphResult<BTreeSet<ObjectId>> {
        self.index.dependency_closure(id)
    }

    pub fn dependents(&self, id: ObjectId) -> Vec<ObjectId> {
        self.index.dependents(id)
    }

    /// Ancestry of an asset, nearest first.
    pub fn chain_of(&self, id: ObjectId) -> GraphResult<Vec<ObjectId>> {
        self.index.chain(id)
    }

    pub fn is_open(&self, id: ObjectId) -> bool {
        self.open.contains_key(&id)
    }

    /// Root object of an open graph asset.
    pub fn asset_root(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.open.get(&id).map(|open| open.root)
    }

    /// Live object of one part of an open graph asset.
    pub fn asset_part(&self, id: ObjectId, part: ObjectId) -> Option<ObjectHandle> {
        self.open
            .get(&id)
            .and_then(|open| open.parts.get(&part).copied())
    }

    /// Asset that owns a live object, if it is an open asset part.
    pub fn owner_of(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.owners.get(&handle).copied()
    }

    // =========================================================================
    // Asset lifecycle
    // =========================================================================

    /// Turns the graph below `root` into a new graph asset and saves it.
    ///
    /// The asset takes the id of its root part.
    pub fn create_asset(&mut self, root: ObjectHandle, name: &str) -> GraphResult<ObjectId> {
        if !self.host.contains(root) {
            return Err(HostError::StaleHandle(root).into());
        }
        if self.owners.contains_key(&root)
            || self.tracker.owner(root).is_some()
            || self.imports.imported_handle(root).is_some()
        {
            return Err(GraphError::AlreadyOwned(root));
        }
        let id = match self.identity.id_of(root) {
            Some(id) if id.is_persistent() => id,
            Some(_) => {
                self.identity.unbind(root);
                self.identity.get_or_create_id(root)
            }
            None => self.identity.get_or_create_id(root),
        };
        if self.index.contains(id) {
            return Err(GraphError::AlreadyOwned(root));
        }

        self.index
            .insert(AssetMetadata::new(id, name, AssetKind::Graph));
        self.open.insert(
            id,
            OpenAsset {
                root,
                parts: BTreeMap::from([(id, root)]),
            },
        );
        self.owners.insert(root, id);
        if let Err(err) = self.save_asset(id) {
            self.index.remove(id);
            if let Some(open) = self.open.remove(&id) {
                for handle in open.parts.values() {
                    self.owners.remove(handle);
                }
            }
            return Err(err);
        }
        info!(asset = %id, name, "created asset");
        Ok(id)
    }

    /// Serializes an open graph asset and writes its metadata and data.
    ///
    /// Refuses with [`GraphError::PartialGraph`] when any part fails to
    /// encode; nothing is written in that case.
    pub fn save_asset(&mut self, id: ObjectId) -> GraphResult<Vec<GraphWarning>> {
        let previous = self.index.get(id)?.clone();
        expect_kind(&previous, &[AssetKind::Graph])?;
        let root = self.open.get(&id).ok_or(GraphError::AssetNotOpen(id))?.root;

        let mut policy = AssetPolicy {
            asset: id,
            identity: &mut self.identity,
            owners: &self.owners,
            tracker: &self.tracker,
            imports: &self.imports,
        };
        let graph = serialize_with(&self.host, &self.codecs, &[root], &mut policy)?;
        if !graph.is_complete() {
            return Err(GraphError::PartialGraph {
                failures: graph.failures,
            });
        }

        let parts = graph.stream.ids();
        let (dependencies, imports) =
            self.dependency_set(graph.stream.external_references(), &parts, Some(&previous));
        let metadata = AssetMetadata {
            dependencies,
            parts,
            imports,
            ..previous
        };
        self.write_asset(metadata, &AssetData::Graph(graph.stream.clone()))?;

        let live: BTreeMap<ObjectId, ObjectHandle> = graph
            .stream
            .entries
            .iter()
            .map(|entry| entry.id)
            .zip(graph.handles.iter().copied())
            .collect();
        if let Some(open) = self.open.get_mut(&id) {
            for (part, handle) in &open.parts {
                if !live.contains_key(part) {
                    self.owners.remove(handle);
                }
            }
            for handle in live.values() {
                self.owners.insert(*handle, id);
            }
            open.parts = live;
        }
        for warning in &graph.warnings {
            warn!(asset = %id, %warning, "asset saved with a degraded reference");
        }
        info!(
            asset = %id,
            parts = graph.stream.len(),
            externals = graph.externals.len(),
            "saved asset"
        );
        Ok(graph.warnings)
    }

    /// Materializes a graph asset, loading its dependencies first.
    ///
    /// Returns the root object. Opening an open asset returns its root.
    pub fn open_asset(&mut self, id: ObjectId) -> GraphResult<ObjectHandle> {
        if let Some(open) = self.open.get(&id) {
            return Ok(open.root);
        }
        let metadata = self.index.get(id)?.clone();
        expect_kind(&metadata, &[AssetKind::Graph])?;
        self.loading.insert(id);
        let result = self.load_asset(&metadata);
        self.loading.remove(&id);
        result
    }

    fn load_asset(&mut self, metadata: &AssetMetadata) -> GraphResult<ObjectHandle> {
        let id = metadata.id;
        self.load_dependencies(metadata)?;
        let stream = self.read_graph(id)?;
        let report = deserialize_graph(
            &mut self.host,
            &self.codecs,
            &mut self.identity,
            &stream,
            LoadOptions::persistent(),
        )?;
        self.check_dangling(&report)?;
        let root = report
            .root()
            .ok_or(GraphError::DanglingReference { id })?;
        let parts: BTreeMap<ObjectId, ObjectHandle> = report.objects.iter().copied().collect();
        for handle in parts.values() {
            self.owners.insert(*handle, id);
        }
        self.open.insert(id, OpenAsset { root, parts });
        info!(
            asset = %id,
            objects = report.objects.len(),
            dangling = report.dangling.len(),
            "opened asset"
        );
        Ok(root)
    }

    /// Re-reads an open asset's data into its existing live objects.
    ///
    /// Parts that no longer exist in storage are destroyed; new parts are
    /// constructed.
    pub fn reload_asset(&mut self, id: ObjectId) -> GraphResult<LoadReport> {
        let open = self
            .open
            .get(&id)
            .cloned()
            .ok_or(GraphError::AssetNotOpen(id))?;
        let stream = self.read_graph(id)?;
        let hydrate: HashMap<ObjectId, ObjectHandle> = open
            .parts
            .iter()
            .filter(|(part, handle)| stream.get(**part).is_some() && self.host.contains(**handle))
            .map(|(part, handle)| (*part, *handle))
            .collect();
        for (part, handle) in &open.parts {
            if !hydrate.contains_key(part) {
                self.owners.remove(handle);
                self.identity.unbind(*handle);
                self.host.destroy(*handle);
            }
        }
        let report = deserialize_graph(
            &mut self.host,
            &self.codecs,
            &mut self.identity,
            &stream,
            LoadOptions::persistent().with_hydrate(hydrate),
        )?;
        let root = report.root().unwrap_or(open.root);
        let parts: BTreeMap<ObjectId, ObjectHandle> = report.objects.iter().copied().collect();
        for handle in parts.values() {
            self.owners.insert(*handle, id);
        }
        self.open.insert(id, OpenAsset { root, parts });
        info!(asset = %id, objects = report.objects.len(), "reloaded asset");
        Ok(report)
    }

    /// Destroys the live objects of an open asset.
    pub fn unload_asset(&mut self, id: ObjectId) -> GraphResult<()> {
        let open = self.open.remove(&id).ok_or(GraphError::AssetNotOpen(id))?;
        for handle in open.parts.values() {
            self.owners.remove(handle);
            self.identity.unbind(*handle);
            self.host.destroy(*handle);
        }
        info!(asset = %id, parts = open.parts.len(), "unloaded asset");
        Ok(())
    }

    /// Removes an asset from the project and from storage.
    ///
    /// Refused while any other asset names it as parent or dependency.
    /// Live instances of the asset are detached.
    pub fn delete_asset(&mut self, id: ObjectId) -> GraphResult<()> {
        self.index.get(id)?;
        let users = self.index.dependents(id);
        if !users.is_empty() {
            return Err(GraphError::AssetInUse { id, users });
        }
        if self.open.contains_key(&id) {
            self.unload_asset(id)?;
        }
        let orphans: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|instance| instance.source() == id || instance.key() == Some(id))
            .map(Instance::id)
            .collect();
        for instance in orphans {
            warn!(asset = %id, %instance, "detaching instance of deleted asset");
            self.detach_instance(instance)?;
        }
        for kind in StreamKind::ALL {
            self.store.remove(id, kind)?;
        }
        self.index.remove(id);
        info!(asset = %id, "deleted asset");
        Ok(())
    }

    pub fn rename_asset(&mut self, id: ObjectId, name: &str) -> GraphResult<()> {
        let metadata = self.index.get_mut(id)?;
        metadata.name = name.to_string();
        let bytes = metadata.to_json()?;
        self.store.write(id, StreamKind::Metadata, &bytes)?;
        debug!(asset = %id, name, "renamed asset");
        Ok(())
    }

    pub fn set_thumbnail(&mut self, id: ObjectId, bytes: &[u8]) -> GraphResult<()> {
        self.index.get(id)?;
        self.store.write(id, StreamKind::Thumbnail, bytes)?;
        Ok(())
    }

    pub fn thumbnail(&self, id: ObjectId) -> GraphResult<Option<Vec<u8>>> {
        self.index.get(id)?;
        if !self.store.exists(id, StreamKind::Thumbnail) {
            return Ok(None);
        }
        Ok(Some(self.store.read(id, StreamKind::Thumbnail)?))
    }

    /// Reads the stored chain of a graph or variant asset.
    pub fn load_chain(&self, id: ObjectId) -> GraphResult<Chain> {
        let ids = self.index.chain(id)?;
        let root = *ids.last().unwrap_or(&id);
        expect_kind(self.index.get(root)?, &[AssetKind::Graph])?;
        let mut chain = Chain::graph(root, self.read_graph(root)?);
        for id in ids.iter().rev().skip(1) {
            let metadata = self.index.get(*id)?;
            let delta = match (metadata.kind, self.read_data(*id)?) {
                (AssetKind::Variant, AssetData::Variant(delta))
                | (AssetKind::Instance, AssetData::Instance(delta)) => delta,
                (kind, other) => {
                    return Err(GraphError::AssetKindMismatch {
                        id: *id,
                        expected: kind.label(),
                        found: other.kind().label(),
                    })
                }
            };
            chain.deltas.push((*id, delta));
        }
        Ok(chain)
    }

    // =========================================================================
    // Internals shared by the asset, instance and variant operations
    // =========================================================================

    /// Imports and opens everything an asset references, before its data.
    ///
    /// An asset that is already being loaded further up the call stack is
    /// skipped: references into it degrade to null.
    fn load_dependencies(&mut self, metadata: &AssetMetadata) -> GraphResult<()> {
        for dependency in &metadata.dependencies {
            if let Some(key) = metadata.import_key(*dependency) {
                self.imports
                    .import(key, &mut self.host, &mut self.identity)?;
                continue;
            }
            if self.loading.contains(dependency) {
                warn!(
                    asset = %metadata.id,
                    dependency = %dependency,
                    "cyclic asset dependency; references into it load as null"
                );
                continue;
            }
            match self.index.get(*dependency).map(|asset| asset.kind) {
                Ok(AssetKind::Graph) => {
                    self.open_asset(*dependency)?;
                }
                Ok(_) => {}
                Err(_) => warn!(
                    asset = %metadata.id,
                    dependency = %dependency,
                    "dependency is not in the project"
                ),
            }
        }
        Ok(())
    }

    /// Fails a load that left references null, when configured to.
    fn check_dangling(&mut self, report: &LoadReport) -> GraphResult<()> {
        for warning in &report.dangling {
            warn!(%warning, "reference loaded as null");
        }
        if !self.config.graph.strict_references {
            return Ok(());
        }
        let target = report.dangling.iter().find_map(|warning| match warning {
            GraphWarning::Dangling { target, .. } => Some(*target),
            _ => None,
        });
        let Some(id) = target else {
            return Ok(());
        };
        for (_, handle) in &report.objects {
            self.identity.unbind(*handle);
            self.host.destroy(*handle);
        }
        Err(GraphError::DanglingReference { id })
    }

    /// Maps referenced ids to the assets and imports that provide them.
    ///
    /// `internal` ids belong to the asset being written and are skipped.
    fn dependency_set(
        &self,
        references: BTreeSet<ObjectId>,
        internal: &BTreeSet<ObjectId>,
        previous: Option<&AssetMetadata>,
    ) -> (BTreeSet<ObjectId>, Vec<ImportRef>) {
        let mut dependencies = BTreeSet::new();
        let mut imports = Vec::new();
        for id in references.into_iter().filter(|id| !internal.contains(id)) {
            let key = self
                .imports
                .get(id)
                .map(|object| object.key.clone())
                .or_else(|| previous.and_then(|m| m.import_key(id)).map(str::to_string));
            if let Some(key) = key {
                dependencies.insert(id);
                imports.push(ImportRef { id, key });
                continue;
            }
            let asset = self
                .identity
                .resolve(id)
                .and_then(|handle| self.owners.get(&handle).copied())
                .or_else(|| {
                    self.index
                        .iter()
                        .find(|asset| asset.kind == AssetKind::Graph && asset.parts.contains(&id))
                        .map(|asset| asset.id)
                });
            match asset {
                Some(asset) => {
                    dependencies.insert(asset);
                }
                None => {
                    warn!(%id, "referenced object belongs to no asset");
                    dependencies.insert(id);
                }
            }
        }
        (dependencies, imports)
    }

    fn read_data(&self, id: ObjectId) -> GraphResult<AssetData> {
        Ok(read_with_recovery(&self.store, id, StreamKind::Data)?)
    }

    fn read_graph(&self, id: ObjectId) -> GraphResult<RecordStream> {
        match self.read_data(id)? {
            AssetData::Graph(stream) => Ok(stream),
            other => Err(GraphError::AssetKindMismatch {
                id,
                expected: AssetKind::Graph.label(),
                found: other.kind().label(),
            }),
        }
    }

    fn read_delta(&self, id: ObjectId) -> GraphResult<Delta> {
        match self.read_data(id)? {
            AssetData::Variant(delta) | AssetData::Instance(delta) => Ok(delta),
            other => Err(GraphError::AssetKindMismatch {
                id,
                expected: "variant or instance",
                found: other.kind().label(),
            }),
        }
    }

    /// Writes data before metadata, so a metadata blob never names data
    /// that was not written.
    fn write_asset(&mut self, metadata: AssetMetadata, data: &AssetData) -> GraphResult<()> {
        let id = metadata.id;
        self.store
            .write(id, StreamKind::Data, &data.to_binary()?)?;
        self.store
            .write(id, StreamKind::Metadata, &metadata.to_json()?)?;
        self.index.insert(metadata);
        Ok(())
    }

    fn allocate_instance_id(&mut self) -> InstanceId {
        let id = InstanceId::new(self.next_instance);
        self.next_instance += 1;
        id
    }
}

fn expect_kind(metadata: &AssetMetadata, allowed: &[AssetKind]) -> GraphResult<()> {
    if allowed.contains(&metadata.kind) {
        return Ok(());
    }
    Err(GraphError::AssetKindMismatch {
        id: metadata.id,
        expected: match allowed {
            [AssetKind::Graph] => "graph",
            [AssetKind::Instance] => "instance",
            _ => "graph or variant",
        },
        found: metadata.kind.label(),
    })
}

// =============================================================================
// Walk policy for asset saves
// =============================================================================

/// Descends into objects of the asset being saved; other assets' parts and
/// imports become leaves, instance objects are excluded. Untracked objects
/// with process-local ids are renamed persistently.
struct AssetPolicy<'p> {
    asset: ObjectId,
    identity: &'p mut IdentityRegistry,
    owners: &'p HashMap<ObjectHandle, ObjectId>,
    tracker: &'p OverrideTracker,
    imports: &'p Imports,
}

impl WalkPolicy for AssetPolicy<'_> {
    fn classify(&mut self, host: &dyn ObjectHost, handle: ObjectHandle) -> Visit {
        if !host.contains(handle) {
            return Visit::Exclude(format!("object {handle} no longer exists"));
        }
        if let Some(id) = self.imports.imported_handle(handle) {
            return Visit::Leaf(id);
        }
        if let Some(instance) = self.tracker.owner(handle) {
            return Visit::Exclude(format!("object belongs to instance {instance}"));
        }
        let owner = self.owners.get(&handle).copied();
        match (owner, self.identity.id_of(handle)) {
            (Some(owner), Some(id)) if owner != self.asset => Visit::Leaf(id),
            (_, Some(id)) if id.is_ephemeral() => {
                self.identity.unbind(handle);
                Visit::Descend(self.identity.get_or_create_id(handle))
            }
            (_, Some(id)) => Visit::Descend(id),
            (_, None) => Visit::Descend(self.identity.get_or_create_id(handle)),
        }
    }
}

#[cfg(test)]
#[path = "../tests/project_tests.rs"]
mod tests;
