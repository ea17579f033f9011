use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use super::{expect_kind, Project};
use crate::asset::{AssetData, AssetKind, AssetMetadata, Delta};
use crate::codec::RecordStream;
use crate::error::{GraphError, GraphResult};
use crate::graph::{deserialize_graph, serialize_with, LoadOptions, Visit, WalkPolicy};
use crate::host::{find_by_path, HostError, ObjectHandle, ObjectHost};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;
use crate::instance::{Instance, InstanceId};
use crate::overrides::OverrideTracker;
use crate::storage::BlobStore;

impl<H: ObjectHost, S: BlobStore> Project<H, S> {
    /// Creates a live instance of a graph, variant or saved instance asset.
    ///
    /// Instance objects get process-local ids; their asset part ids are kept
    /// as the instance's part mapping. The chain's overrides are applied
    /// before this returns.
    pub fn instantiate(&mut self, asset: ObjectId) -> GraphResult<InstanceId> {
        if self.index.get(asset)?.kind == AssetKind::Instance {
            return self.load_instance(asset);
        }
        self.materialize_instance(asset, None)
    }

    /// Loads a saved instance asset: its source chain, its added objects and
    /// its stored overrides.
    pub fn load_instance(&mut self, key: ObjectId) -> GraphResult<InstanceId> {
        let metadata = self.index.get(key)?.clone();
        expect_kind(&metadata, &[AssetKind::Instance])?;
        let source = metadata
            .parent
            .ok_or(GraphError::DanglingReference { id: key })?;
        let delta = self.read_delta(key)?;
        self.load_dependencies(&metadata)?;
        self.materialize_instance(source, Some((key, delta)))
    }

    fn materialize_instance(
        &mut self,
        source: ObjectId,
        saved: Option<(ObjectId, Delta)>,
    ) -> GraphResult<InstanceId> {
        expect_kind(
            self.index.get(source)?,
            &[AssetKind::Graph, AssetKind::Variant],
        )?;
        let chain = self.load_chain(source)?;
        for id in chain.ids() {
            let metadata = self.index.get(id)?.clone();
            self.load_dependencies(&metadata)?;
        }

        let mut stream = chain.materialization();
        let added: BTreeSet<ObjectId> = match &saved {
            Some((_, delta)) => {
                stream.extend_from(&delta.added);
                delta.added.ids()
            }
            None => BTreeSet::new(),
        };
        let report = deserialize_graph(
            &mut self.host,
            &self.codecs,
            &mut self.identity,
            &stream,
            LoadOptions::ephemeral(),
        )?;
        self.check_dangling(&report)?;
        let root = report
            .root()
            .ok_or(GraphError::DanglingReference { id: chain.root })?;

        let id = self.allocate_instance_id();
        let mut instance = Instance::new(id, source, root);
        for (part, handle) in &report.objects {
            if added.contains(part) {
                instance.insert_added(*part, *handle);
            } else {
                instance.insert_part(*part, *handle);
            }
            self.tracker.track(*handle, id);
        }
        if let Some((key, delta)) = saved {
            instance.overrides = delta.overrides.clone();
            instance.observed = delta.observed;
            instance.saved = delta.overrides;
            instance.set_key(key);
        }
        self.instances.insert(id, instance);

        if let Err(err) = self.apply_instance_overrides(id) {
            self.release_instance(id)?;
            return Err(err);
        }
        info!(
            instance = %id,
            source = %source,
            objects = report.objects.len(),
            "instantiated asset"
        );
        Ok(id)
    }

    pub fn instance(&self, id: InstanceId) -> GraphResult<&Instance> {
        self.instances.get(&id).ok_or(GraphError::UnknownInstance(id))
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Instance that owns a live object, if any.
    pub fn instance_of(&self, handle: ObjectHandle) -> Option<InstanceId> {
        self.tracker.owner(handle)
    }

    /// Destroys an instance's live objects and forgets it.
    ///
    /// A detached instance no longer owns its objects; they stay alive.
    pub fn release_instance(&mut self, id: InstanceId) -> GraphResult<()> {
        let instance = self
            .instances
            .remove(&id)
            .ok_or(GraphError::UnknownInstance(id))?;
        let handles = instance.handles();
        for handle in &handles {
            self.tracker.untrack(*handle);
            self.identity.unbind(*handle);
            self.host.destroy(*handle);
        }
        debug!(instance = %id, objects = handles.len(), "released instance");
        Ok(())
    }

    /// Discards the part mapping: the objects become plain live objects.
    pub fn detach_instance(&mut self, id: InstanceId) -> GraphResult<()> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(GraphError::UnknownInstance(id))?;
        for handle in instance.handles() {
            self.tracker.untrack(handle);
        }
        instance.detach();
        info!(instance = %id, "detached instance");
        Ok(())
    }

    /// Removes one object from an instance's mapping, with its overrides.
    ///
    /// Returns the part id it was mapped to.
    pub fn detach_part(&mut self, id: InstanceId, handle: ObjectHandle) -> GraphResult<ObjectId> {
        let instance = self.attached_mut(id)?;
        if instance.root() == handle {
            return Err(HostError::Refused(format!(
                "root {handle} of instance {id} cannot be detached"
            ))
            .into());
        }
        let part = instance
            .remove_part(handle)
            .ok_or(GraphError::UnknownObject(handle))?;
        self.tracker.untrack(handle);
        debug!(instance = %id, %part, "detached part");
        Ok(part)
    }

    /// Resolves a `/`-separated name path below the instance root.
    pub fn find_part(&self, id: InstanceId, path: &str) -> GraphResult<Option<ObjectHandle>> {
        let instance = self.instance(id)?;
        Ok(find_by_path(&self.host, instance.root(), path)
            .filter(|handle| instance.owns(*handle)))
    }

    /// Flags an instance object as changed since the last collection.
    ///
    /// Returns false when it already was.
    pub fn mark_dirty(&mut self, handle: ObjectHandle) -> GraphResult<bool> {
        if self.tracker.owner(handle).is_none() {
            return Err(GraphError::UnknownObject(handle));
        }
        Ok(self.tracker.mark_dirty(handle))
    }

    /// Stores the instance's overrides and added objects as an instance
    /// asset whose parent is the instance's source.
    ///
    /// Saving again overwrites the same asset.
    pub fn save_instance(&mut self, id: InstanceId, name: &str) -> GraphResult<ObjectId> {
        self.collect_overrides(id)?;
        let (added, externals) = self.discover_added(id)?;
        let (key, source) = {
            let instance = self.attached(id)?;
            (instance.key(), instance.source())
        };
        let key = match key {
            Some(key) => key,
            None => self.identity.allocate(),
        };
        let instance = self.attached(id)?;
        let delta = Delta {
            overrides: instance.overrides.clone(),
            added,
            observed: instance.observed.clone(),
        };

        let chain_parts = self.load_chain(source)?.part_ids();
        let mut internal = chain_parts;
        internal.extend(delta.added.ids());
        let mut references = delta.references();
        references.extend(externals);
        let previous = self.index.get(key).ok().cloned();
        let (dependencies, imports) =
            self.dependency_set(references, &internal, previous.as_ref());
        let metadata = AssetMetadata {
            parent: Some(source),
            dependencies,
            parts: delta.added.ids(),
            imports,
            ..AssetMetadata::new(key, name, AssetKind::Instance)
        };
        self.write_asset(metadata, &AssetData::Instance(delta))?;

        let instance = self.attached_mut(id)?;
        instance.saved = instance.overrides.clone();
        instance.set_key(key);
        info!(
            instance = %id,
            asset = %key,
            overrides = instance.overrides.len(),
            "saved instance"
        );
        Ok(key)
    }

    /// Walks the instance for objects that are not parts of its source.
    ///
    /// Newly found objects join the instance as added objects. Returns their
    /// records and the leaf ids the walk referenced.
    pub(super) fn discover_added(
        &mut self,
        id: InstanceId,
    ) -> GraphResult<(RecordStream, BTreeSet<ObjectId>)> {
        let instance = self
            .instances
            .get(&id)
            .ok_or(GraphError::UnknownInstance(id))?;
        if instance.is_detached() {
            return Err(GraphError::DetachedInstance(id));
        }
        let mut roots = instance.handles();
        roots.sort();
        let mut policy = InstancePolicy {
            instance,
            identity: &mut self.identity,
            tracker: &self.tracker,
            found: HashMap::new(),
        };
        let graph = serialize_with(&self.host, &self.codecs, &roots, &mut policy)?;
        let found = policy.found;
        if !graph.is_complete() {
            return Err(GraphError::PartialGraph {
                failures: graph.failures,
            });
        }

        let instance = self.attached_mut(id)?;
        let mut added = RecordStream::new();
        let mut joined = Vec::new();
        for (entry, handle) in graph.stream.entries.iter().zip(&graph.handles) {
            if instance.part(entry.id).is_some() {
                continue;
            }
            if found.contains_key(handle) {
                instance.insert_added(entry.id, *handle);
                joined.push(*handle);
            }
            added.push(entry.id, entry.record.clone());
        }
        for handle in &joined {
            self.tracker.track(*handle, id);
        }
        if !joined.is_empty() {
            debug!(instance = %id, joined = joined.len(), "new objects joined instance");
        }
        for warning in &graph.warnings {
            warn!(instance = %id, %warning, "instance object skipped");
        }
        Ok((added, graph.externals))
    }

    pub(super) fn attached(&self, id: InstanceId) -> GraphResult<&Instance> {
        let instance = self.instance(id)?;
        if instance.is_detached() {
            return Err(GraphError::DetachedInstance(id));
        }
        Ok(instance)
    }

    pub(super) fn attached_mut(&mut self, id: InstanceId) -> GraphResult<&mut Instance> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(GraphError::UnknownInstance(id))?;
        if instance.is_detached() {
            return Err(GraphError::DetachedInstance(id));
        }
        Ok(instance)
    }
}

// =============================================================================
// Walk policy for instance saves
// =============================================================================

/// Descends into an instance's own objects, under their part or added ids,
/// and into untracked objects they reach, which get fresh persistent ids.
/// Persistently named objects outside the instance become leaves, and so do
/// detached parts under their former part ids.
struct InstancePolicy<'p> {
    instance: &'p Instance,
    identity: &'p mut IdentityRegistry,
    tracker: &'p OverrideTracker,
    found: HashMap<ObjectHandle, ObjectId>,
}

impl WalkPolicy for InstancePolicy<'_> {
    fn classify(&mut self, host: &dyn ObjectHost, handle: ObjectHandle) -> Visit {
        if !host.contains(handle) {
            return Visit::Exclude(format!("object {handle} no longer exists"));
        }
        if let Some(id) = self.instance.id_of(handle) {
            return Visit::Descend(id);
        }
        if self.instance.is_detached_part(handle) {
            return match self.instance.detached_origin(handle) {
                Some(origin) => Visit::Leaf(origin),
                None => Visit::Exclude(format!("object {handle} was detached")),
            };
        }
        if let Some(owner) = self.tracker.owner(handle) {
            return Visit::Exclude(format!("object belongs to instance {owner}"));
        }
        match self.identity.id_of(handle) {
            Some(id) if id.is_persistent() => Visit::Leaf(id),
            _ => {
                let id = self.identity.allocate();
                self.found.insert(handle, id);
                Visit::Descend(id)
            }
        }
    }
}
