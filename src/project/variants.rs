//! Variant engine operations over live instances.
//!
//! # Contracts
//! - **Precondition**: `apply_changes_to_base` runs only when
//!   `can_apply_to_base` holds; otherwise it fails with
//!   [`GraphError::ConflictingOverride`] and writes nothing.
//! - **Postcondition**: after a successful apply the instance carries no
//!   overrides; the values are inherited from its source.
//! - **Invariant**: the stored chain is never merged; every effective value
//!   is recomputed from it, so repeated applies are idempotent.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::Project;
use crate::asset::{AssetData, AssetKind, AssetMetadata, Delta};
use crate::codec::{Record, Resolution};
use crate::error::{GraphError, GraphResult, OverrideConflict};
use crate::graph::GraphWarning;
use crate::host::{ObjectHandle, ObjectHost};
use crate::id::ObjectId;
use crate::instance::InstanceId;
use crate::overrides::{diff_record, OverrideKey, OverrideRecord, OverrideSet};
use crate::storage::{BlobStore, StreamKind};
use crate::variant::{apply_to_stream, find_conflicts, ApplyReport, RevertScope};

impl<H: ObjectHost, S: BlobStore> Project<H, S> {
    /// Diffs the instance's dirty parts against its source's effective
    /// records and updates its override set.
    ///
    /// Returns the overrides now held for the collected parts. Fields that
    /// went back to their base value lose their override. The dirty flags
    /// of the collected objects are cleared. New objects reachable from the
    /// instance join it first, as added objects.
    pub fn collect_overrides(&mut self, id: InstanceId) -> GraphResult<Vec<OverrideRecord>> {
        let instance = self.attached(id)?;
        let source = instance.source();
        let dirty = self.tracker.dirty_for(id);
        if dirty.is_empty() {
            return Ok(Vec::new());
        }
        // New objects need ids before dirty parts can reference them.
        self.discover_added(id)?;
        let records = self.load_chain(source)?.effective();
        let effective = records.lookup();

        let instance = self.attached(id)?;
        let identity = &self.identity;
        let mut live: BTreeMap<ObjectId, Record> = BTreeMap::new();
        for handle in &dirty {
            let Some(part) = instance.origin(*handle) else {
                continue;
            };
            let mut resolver = |target: ObjectHandle| {
                instance
                    .id_of(target)
                    .or_else(|| instance.detached_origin(target))
                    .or_else(|| identity.id_of(target).filter(ObjectId::is_persistent))
            };
            let encoded = self.codecs.encode(&self.host, *handle, &mut resolver)?;
            for (field, target) in &encoded.unresolved {
                warn!(instance = %id, %part, %field, %target, "reference to an unnamed object dropped");
            }
            live.insert(part, encoded.record);
        }

        let instance = self.attached_mut(id)?;
        let mut collected = Vec::new();
        for (part, record) in &live {
            let Some(base) = effective.get(*part) else {
                warn!(instance = %id, %part, "part no longer exists in the source");
                continue;
            };
            let diverged = diff_record(*part, record, base);
            for field in record.fields.keys() {
                let key = OverrideKey::new(*part, *field);
                match diverged.iter().find(|candidate| candidate.field == *field) {
                    Some(divergence) => {
                        if !instance.overrides.contains(&key) {
                            match effective.field(key.part, key.field) {
                                Some(observed) => {
                                    instance.observed.insert(key, observed.clone());
                                }
                                None => {
                                    instance.observed.remove(&key);
                                }
                            }
                        }
                        instance.overrides.insert(key, divergence.value.clone());
                        collected.push(divergence.clone());
                    }
                    None => {
                        instance.overrides.remove(&key);
                        instance.observed.remove(&key);
                    }
                }
            }
        }
        self.tracker.clear(&dirty);
        debug!(
            instance = %id,
            parts = live.len(),
            overrides = collected.len(),
            "collected overrides"
        );
        Ok(collected)
    }

    /// Snapshots the instance's overrides and added objects as a new variant
    /// of its source, then rebinds the instance to that variant.
    pub fn create_variant(&mut self, id: InstanceId, name: &str) -> GraphResult<ObjectId> {
        self.collect_overrides(id)?;
        let (added, externals) = self.discover_added(id)?;
        let instance = self.attached(id)?;
        let source = instance.source();
        let delta = Delta {
            overrides: instance.overrides.clone(),
            added,
            observed: instance.observed.clone(),
        };

        let variant = self.identity.allocate();
        let mut internal = self.load_chain(source)?.part_ids();
        internal.extend(delta.added.ids());
        let mut references = delta.references();
        references.extend(externals);
        let (dependencies, imports) = self.dependency_set(references, &internal, None);
        let metadata = AssetMetadata {
            parent: Some(source),
            dependencies,
            parts: delta.added.ids(),
            imports,
            ..AssetMetadata::new(variant, name, AssetKind::Variant)
        };
        let overrides = delta.overrides.len();
        self.write_asset(metadata, &AssetData::Variant(delta))?;

        let instance = self.attached_mut(id)?;
        instance.rebind(variant);
        instance.promote_added();
        info!(
            variant = %variant,
            base = %source,
            instance = %id,
            overrides,
            "created variant"
        );
        Ok(variant)
    }

    /// Writes the chain's overrides, then the instance's own, into the live
    /// parts of the instance.
    pub fn apply_instance_overrides(&mut self, id: InstanceId) -> GraphResult<ApplyReport> {
        let source = self.attached(id)?.source();
        let mut layered = self.load_chain(source)?.layered();
        let instance = self
            .instances
            .get(&id)
            .ok_or(GraphError::UnknownInstance(id))?;
        layered.layer(&instance.overrides);

        let identity = &self.identity;
        let mut resolver = |target: ObjectId| match instance
            .resolve(target)
            .or_else(|| identity.resolve(target))
        {
            Some(handle) => Resolution::Ready(handle),
            None => Resolution::Dangling,
        };
        let mut report = ApplyReport::default();
        for (key, value) in layered.iter() {
            let Some(handle) = instance.resolve(key.part) else {
                report.dangling.push(GraphWarning::MissingPart {
                    part: key.part,
                    field: key.field,
                });
                continue;
            };
            let missing =
                self.codecs
                    .write_field(&mut self.host, handle, key.field, value, &mut resolver)?;
            for target in missing {
                report.dangling.push(GraphWarning::Dangling {
                    owner: key.part,
                    field: key.field,
                    target,
                });
            }
            report.applied.push(*key);
        }
        for warning in &report.dangling {
            warn!(instance = %id, %warning, "override applied with a degraded reference");
        }
        debug!(instance = %id, applied = report.applied.len(), "applied overrides");
        Ok(report)
    }

    /// Overrides that block pushing the instance's changes into its source.
    pub fn apply_conflicts(&mut self, id: InstanceId) -> GraphResult<Vec<OverrideConflict>> {
        self.sync_dirty()?;
        let instance = self.attached(id)?;
        let source = instance.source();
        let key = instance.key();
        let base = self.load_chain(source)?.effective();

        let mut siblings = Vec::new();
        for sibling in self.index.children_of(source, Some(AssetKind::Instance)) {
            if Some(sibling) == key {
                continue;
            }
            siblings.push((sibling, self.read_delta(sibling)?.overrides));
        }
        let instance = self.attached(id)?;
        Ok(find_conflicts(
            &instance.overrides,
            &instance.observed,
            &base,
            &siblings,
        ))
    }

    /// True when the instance's changes can be pushed into its source
    /// without clobbering a change made elsewhere.
    pub fn can_apply_to_base(&mut self, id: InstanceId) -> GraphResult<bool> {
        Ok(self.apply_conflicts(id)?.is_empty())
    }

    /// Pushes the instance's overrides and added objects into its source.
    ///
    /// A graph source has the values written into its records; a variant
    /// source takes them into its own delta. Other instances and variants
    /// derived from the source see the change the next time they load.
    pub fn apply_changes_to_base(&mut self, id: InstanceId) -> GraphResult<Vec<OverrideKey>> {
        let conflicts = self.apply_conflicts(id)?;
        if !conflicts.is_empty() {
            return Err(GraphError::ConflictingOverride {
                instance: id,
                conflicts,
            });
        }
        let (added, externals) = self.discover_added(id)?;
        let instance = self.attached(id)?;
        let source = instance.source();
        let overrides = instance.overrides.clone();
        if overrides.is_empty() && added.is_empty() {
            return Ok(Vec::new());
        }

        let previous = self.index.get(source)?.clone();
        let data = match self.read_data(source)? {
            AssetData::Graph(mut stream) => {
                for key in apply_to_stream(&mut stream, &overrides) {
                    warn!(base = %source, %key, "override names a part the base lacks");
                }
                stream.extend_from(&added);
                AssetData::Graph(stream)
            }
            AssetData::Variant(mut delta) => {
                let inherited = match previous.parent {
                    Some(parent) => self.load_chain(parent)?.effective(),
                    None => Default::default(),
                };
                let parent = inherited.lookup();
                for key in overrides.keys() {
                    if delta.overrides.contains(key) {
                        continue;
                    }
                    if let Some(value) = parent.field(key.part, key.field) {
                        delta.observed.insert(*key, value.clone());
                    }
                }
                delta.overrides.layer(&overrides);
                delta.added.extend_from(&added);
                AssetData::Variant(delta)
            }
            AssetData::Instance(_) => {
                return Err(GraphError::AssetKindMismatch {
                    id: source,
                    expected: "graph or variant",
                    found: AssetKind::Instance.label(),
                })
            }
        };
        let (mut references, internal, parts) = match &data {
            AssetData::Graph(stream) => {
                (stream.external_references(), stream.ids(), stream.ids())
            }
            AssetData::Variant(delta) | AssetData::Instance(delta) => {
                let mut internal = match previous.parent {
                    Some(parent) => self.load_chain(parent)?.part_ids(),
                    None => Default::default(),
                };
                internal.extend(delta.added.ids());
                (delta.references(), internal, delta.added.ids())
            }
        };
        references.extend(externals);
        let (dependencies, imports) =
            self.dependency_set(references, &internal, Some(&previous));
        let metadata = AssetMetadata {
            dependencies,
            parts,
            imports,
            ..previous
        };
        self.write_asset(metadata, &data)?;

        let instance = self.attached_mut(id)?;
        let applied: Vec<OverrideKey> = instance.overrides.keys().copied().collect();
        instance.overrides.clear();
        instance.observed.clear();
        instance.promote_added();
        let key = instance.key();
        info!(
            instance = %id,
            base = %source,
            applied = applied.len(),
            added = added.len(),
            "applied instance changes to base"
        );

        if self.is_open(source) {
            self.reload_asset(source)?;
        }
        if let Some(key) = key {
            let name = self.index.get(key)?.name.clone();
            self.save_instance(id, &name)?;
        }
        Ok(applied)
    }

    /// True when the instance carries overrides that a revert would discard.
    pub fn can_revert_to_base(&mut self, id: InstanceId) -> GraphResult<bool> {
        self.collect_overrides(id)?;
        Ok(!self.attached(id)?.overrides.is_empty())
    }

    /// Discards the instance's overrides in `scope` and re-reads those fields
    /// from the source's effective records. A saved instance is re-saved.
    ///
    /// Other instances are untouched until they reload.
    pub fn revert_changes_to_base(
        &mut self,
        id: InstanceId,
        scope: RevertScope,
    ) -> GraphResult<Vec<OverrideKey>> {
        self.collect_overrides(id)?;
        let source = self.attached(id)?.source();
        let records = self.load_chain(source)?.effective();
        let effective = records.lookup();
        let instance = self
            .instances
            .get(&id)
            .ok_or(GraphError::UnknownInstance(id))?;
        let reverted: Vec<OverrideKey> = instance
            .overrides
            .keys()
            .filter(|key| scope.includes(key))
            .copied()
            .collect();

        let identity = &self.identity;
        let mut resolver = |target: ObjectId| match instance
            .resolve(target)
            .or_else(|| identity.resolve(target))
        {
            Some(handle) => Resolution::Ready(handle),
            None => Resolution::Dangling,
        };
        for key in &reverted {
            let (Some(handle), Some(value)) =
                (instance.part(key.part), effective.field(key.part, key.field))
            else {
                continue;
            };
            let missing =
                self.codecs
                    .write_field(&mut self.host, handle, key.field, value, &mut resolver)?;
            for target in missing {
                warn!(instance = %id, %key, %target, "reverted reference left null");
            }
        }

        let instance = self.attached_mut(id)?;
        for key in &reverted {
            instance.overrides.remove(key);
            instance.observed.remove(key);
        }
        let saved_key = instance.key();
        if let Some(saved_key) = saved_key {
            let name = self.index.get(saved_key)?.name.clone();
            self.save_instance(id, &name)?;
        }
        info!(instance = %id, reverted = reverted.len(), "reverted instance changes");
        Ok(reverted)
    }

    /// Moves a variant onto another parent with the same root graph.
    ///
    /// Rejected before any write when the new parent would close a cycle.
    pub fn rebase_variant(&mut self, variant: ObjectId, new_parent: ObjectId) -> GraphResult<()> {
        self.index.check_rebase(variant, new_parent)?;
        let mut metadata = self.index.get(variant)?.clone();
        let parts = self.load_chain(new_parent)?.part_ids();
        let delta = self.read_delta(variant)?;
        let own = delta.added.ids();
        let stranded: OverrideSet = delta
            .overrides
            .records()
            .into_iter()
            .filter(|record| !parts.contains(&record.part) && !own.contains(&record.part))
            .collect();
        for key in stranded.keys() {
            warn!(%variant, %key, "override names a part the new parent lacks");
        }
        metadata.parent = Some(new_parent);
        self.store
            .write(variant, StreamKind::Metadata, &metadata.to_json()?)?;
        self.index.insert(metadata);
        info!(%variant, parent = %new_parent, "rebased variant");
        Ok(())
    }

    /// Collects overrides of every instance with dirty objects.
    fn sync_dirty(&mut self) -> GraphResult<()> {
        for instance in self.tracker.dirty_instances() {
            if self.attached(instance).is_ok() {
                self.collect_overrides(instance)?;
            }
        }
        Ok(())
    }
}
