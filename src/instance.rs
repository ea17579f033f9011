//! Live instances of assets.
//!
//! # Contracts
//! - **Invariant**: `parts` and `origins` are inverse maps; every attached
//!   part maps to exactly one asset part id.
//! - **Invariant**: a detached instance has no part mapping and no overrides.
//! - **Invariant**: a detached part never rejoins the mapping; saves refer to
//!   it by its former part id, or not at all when it was an added object.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::host::ObjectHandle;
use crate::id::ObjectId;
use crate::overrides::{OverrideKey, OverrideSet};

/// Process-local instance handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// A live materialization of a graph or variant asset.
#[derive(Clone, Debug)]
pub struct Instance {
    id: InstanceId,
    source: ObjectId,
    root: ObjectHandle,
    parts: BTreeMap<ObjectId, ObjectHandle>,
    origins: HashMap<ObjectHandle, ObjectId>,
    added: BTreeMap<ObjectId, ObjectHandle>,
    added_ids: HashMap<ObjectHandle, ObjectId>,
    pub(crate) overrides: OverrideSet,
    pub(crate) observed: OverrideSet,
    pub(crate) saved: OverrideSet,
    key: Option<ObjectId>,
    detached: bool,
    detached_parts: HashMap<ObjectHandle, Option<ObjectId>>,
}

impl Instance {
    pub(crate) fn new(id: InstanceId, source: ObjectId, root: ObjectHandle) -> Self {
        Self {
            id,
            source,
            root,
            parts: BTreeMap::new(),
            origins: HashMap::new(),
            added: BTreeMap::new(),
            added_ids: HashMap::new(),
            overrides: OverrideSet::new(),
            observed: OverrideSet::new(),
            saved: OverrideSet::new(),
            key: None,
            detached: false,
            detached_parts: HashMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The graph or variant asset this instance derives from.
    #[inline]
    pub fn source(&self) -> ObjectId {
        self.source
    }

    #[inline]
    pub fn root(&self) -> ObjectHandle {
        self.root
    }

    /// Id of the saved instance asset, once saved or loaded.
    #[inline]
    pub fn key(&self) -> Option<ObjectId> {
        self.key
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn overrides(&self) -> &OverrideSet {
        &self.overrides
    }

    pub fn is_overridden(&self, key: &OverrideKey) -> bool {
        self.overrides.contains(key)
    }

    /// Live part of an asset part id.
    pub fn part(&self, origin: ObjectId) -> Option<ObjectHandle> {
        self.parts.get(&origin).copied()
    }

    /// Asset part id of a live part.
    pub fn origin(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.origins.get(&handle).copied()
    }

    pub fn parts(&self) -> impl Iterator<Item = (ObjectId, ObjectHandle)> + '_ {
        self.parts.iter().map(|(id, handle)| (*id, *handle))
    }

    /// Objects created on the instance that have no counterpart in its source.
    pub fn added(&self) -> impl Iterator<Item = (ObjectId, ObjectHandle)> + '_ {
        self.added.iter().map(|(id, handle)| (*id, *handle))
    }

    pub fn added_id(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.added_ids.get(&handle).copied()
    }

    /// Handle of a part or added object by id.
    pub fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.parts
            .get(&id)
            .or_else(|| self.added.get(&id))
            .copied()
    }

    /// Id of a part or added object by handle.
    pub fn id_of(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.origins
            .get(&handle)
            .or_else(|| self.added_ids.get(&handle))
            .copied()
    }

    /// Whether the object was removed from the mapping by a part detach.
    pub fn is_detached_part(&self, handle: ObjectHandle) -> bool {
        self.detached_parts.contains_key(&handle)
    }

    /// Source part id a detached part was mapped to. `None` for detached
    /// added objects, which the source never stored.
    pub fn detached_origin(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.detached_parts.get(&handle).copied().flatten()
    }

    pub fn owns(&self, handle: ObjectHandle) -> bool {
        self.origins.contains_key(&handle) || self.added_ids.contains_key(&handle)
    }

    /// Every live object of the instance.
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.parts
            .values()
            .chain(self.added.values())
            .copied()
            .collect()
    }

    pub(crate) fn insert_part(&mut self, origin: ObjectId, handle: ObjectHandle) {
        self.parts.insert(origin, handle);
        self.origins.insert(handle, origin);
    }

    pub(crate) fn insert_added(&mut self, id: ObjectId, handle: ObjectHandle) {
        self.added.insert(id, handle);
        self.added_ids.insert(handle, id);
    }

    /// Turns added objects into parts once their source stores them.
    pub(crate) fn promote_added(&mut self) {
        let added = std::mem::take(&mut self.added);
        self.added_ids.clear();
        for (id, handle) in added {
            self.insert_part(id, handle);
        }
    }

    /// Drops one part from the mapping, with its overrides.
    pub(crate) fn remove_part(&mut self, handle: ObjectHandle) -> Option<ObjectId> {
        if let Some(origin) = self.origins.remove(&handle) {
            self.parts.remove(&origin);
            self.overrides.retain(|key, _| key.part != origin);
            self.observed.retain(|key, _| key.part != origin);
            self.detached_parts.insert(handle, Some(origin));
            return Some(origin);
        }
        let id = self.added_ids.remove(&handle)?;
        self.added.remove(&id);
        self.detached_parts.insert(handle, None);
        Some(id)
    }

    pub(crate) fn rebind(&mut self, source: ObjectId) {
        self.source = source;
        self.overrides.clear();
        self.observed.clear();
        self.saved.clear();
    }

    pub(crate) fn set_key(&mut self, key: ObjectId) {
        self.key = Some(key);
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
        self.parts.clear();
        self.origins.clear();
        self.added.clear();
        self.added_ids.clear();
        self.overrides.clear();
        self.observed.clear();
        self.saved.clear();
        self.detached_parts.clear();
        self.key = None;
    }
}
