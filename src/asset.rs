//! Asset metadata, asset data blobs and the in-memory asset index.
//!
//! # Contracts
//! - **Invariant**: a graph asset's id is the id of its root part.
//! - **Invariant**: `dependencies` holds the ids of the other assets and of
//!   the imports that the asset's data references. A referenced id that no
//!   known asset owns is kept as is, so loads can report it.
//! - **Invariant**: variant chains in the index are acyclic; see
//!   [`AssetIndex::check_rebase`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::RecordStream;
use crate::error::{GraphError, GraphResult};
use crate::id::ObjectId;
use crate::overrides::OverrideSet;
use crate::storage::{decode_envelope, encode_envelope, StorageError};
use crate::version::METADATA_FORMAT_VERSION;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Full record stream of one root and its parts.
    Graph,
    /// Delta over a base graph or base variant.
    Variant,
    /// Saved instance-level overrides over a graph or variant.
    Instance,
}

impl AssetKind {
    pub fn label(self) -> &'static str {
        match self {
            AssetKind::Graph => "graph",
            AssetKind::Variant => "variant",
            AssetKind::Instance => "instance",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Externally imported object an asset depends on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImportRef {
    pub id: ObjectId,
    pub key: String,
}

/// Independently readable description of one asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub id: ObjectId,
    pub name: String,
    pub kind: AssetKind,
    #[serde(default)]
    pub parent: Option<ObjectId>,
    #[serde(default)]
    pub dependencies: BTreeSet<ObjectId>,
    /// Part ids stored by this asset (graph entries or added variant parts).
    #[serde(default)]
    pub parts: BTreeSet<ObjectId>,
    #[serde(default)]
    pub imports: Vec<ImportRef>,
    pub format_version: u16,
}

impl AssetMetadata {
    pub fn new(id: ObjectId, name: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            parent: None,
            dependencies: BTreeSet::new(),
            parts: BTreeSet::new(),
            imports: Vec::new(),
            format_version: METADATA_FORMAT_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, StorageError> {
        let metadata: AssetMetadata =
            serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if metadata.format_version > METADATA_FORMAT_VERSION {
            return Err(StorageError::IncompatibleVersion {
                found: metadata.format_version,
                expected: METADATA_FORMAT_VERSION,
            });
        }
        Ok(metadata)
    }

    pub fn import_key(&self, id: ObjectId) -> Option<&str> {
        self.imports
            .iter()
            .find(|import| import.id == id)
            .map(|import| import.key.as_str())
    }
}

/// Stored changes of a variant or saved instance relative to its parent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub overrides: OverrideSet,
    /// Parts that do not exist in the parent.
    pub added: RecordStream,
    /// Parent values seen when each override was first recorded.
    pub observed: OverrideSet,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && self.added.is_empty()
    }

    /// Ids referenced by overrides and added parts.
    pub fn references(&self) -> BTreeSet<ObjectId> {
        let mut ids: BTreeSet<ObjectId> = self
            .overrides
            .iter()
            .flat_map(|(_, value)| value.references())
            .collect();
        ids.extend(
            self.added
                .entries
                .iter()
                .flat_map(|entry| entry.record.references().map(|(_, id)| id)),
        );
        ids
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetData {
    Graph(RecordStream),
    Variant(Delta),
    Instance(Delta),
}

impl AssetData {
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetData::Graph(_) => AssetKind::Graph,
            AssetData::Variant(_) => AssetKind::Variant,
            AssetData::Instance(_) => AssetKind::Instance,
        }
    }

    pub fn delta(&self) -> Option<&Delta> {
        match self {
            AssetData::Graph(_) => None,
            AssetData::Variant(delta) | AssetData::Instance(delta) => Some(delta),
        }
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, StorageError> {
        encode_envelope(self)
    }

    pub fn from_binary(input: &[u8]) -> Result<Self, StorageError> {
        decode_envelope(input)
    }
}

// =============================================================================
// AssetIndex
// =============================================================================

/// Metadata of every asset in a project, keyed by id.
#[derive(Clone, Debug, Default)]
pub struct AssetIndex {
    assets: BTreeMap<ObjectId, AssetMetadata>,
}

impl AssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metadata: AssetMetadata) -> Option<AssetMetadata> {
        self.assets.insert(metadata.id, metadata)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<AssetMetadata> {
        self.assets.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> GraphResult<&AssetMetadata> {
        self.assets.get(&id).ok_or(GraphError::UnknownAsset(id))
    }

    pub fn get_mut(&mut self, id: ObjectId) -> GraphResult<&mut AssetMetadata> {
        self.assets.get_mut(&id).ok_or(GraphError::UnknownAsset(id))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.assets.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetMetadata> {
        self.assets.values()
    }

    /// `id` followed by its ancestors, nearest first, ending at a graph asset.
    pub fn chain(&self, id: ObjectId) -> GraphResult<Vec<ObjectId>> {
        let mut chain = vec![id];
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            if chain.contains(&parent) {
                chain.push(parent);
                return Err(GraphError::CyclicDependency { chain });
            }
            chain.push(parent);
            current = self.get(parent)?;
        }
        Ok(chain)
    }

    /// The graph asset at the base of `id`'s chain.
    pub fn root_of(&self, id: ObjectId) -> GraphResult<ObjectId> {
        let chain = self.chain(id)?;
        Ok(*chain.last().unwrap_or(&id))
    }

    /// Assets that name `id` as parent or dependency.
    pub fn dependents(&self, id: ObjectId) -> Vec<ObjectId> {
        self.assets
            .values()
            .filter(|asset| asset.parent == Some(id) || asset.dependencies.contains(&id))
            .map(|asset| asset.id)
            .collect()
    }

    /// Assets whose parent is `id`, optionally restricted to one kind.
    pub fn children_of(&self, id: ObjectId, kind: Option<AssetKind>) -> Vec<ObjectId> {
        self.assets
            .values()
            .filter(|asset| asset.parent == Some(id))
            .filter(|asset| kind.map_or(true, |kind| asset.kind == kind))
            .map(|asset| asset.id)
            .collect()
    }

    /// Every id `id` transitively needs: parents and dependencies.
    ///
    /// Ids that are not assets (imports) are included but not expanded.
    pub fn dependency_closure(&self, id: ObjectId) -> GraphResult<BTreeSet<ObjectId>> {
        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        self.get(id)?;
        while let Some(current) = queue.pop_front() {
            let Ok(asset) = self.get(current) else {
                continue;
            };
            for next in asset.dependencies.iter().copied().chain(asset.parent) {
                if next != id && closure.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(closure)
    }

    /// Rejects making `new_parent` the parent of `variant` when that would
    /// close a cycle or move the variant to a different root graph.
    pub fn check_rebase(&self, variant: ObjectId, new_parent: ObjectId) -> GraphResult<()> {
        let metadata = self.get(variant)?;
        if metadata.kind != AssetKind::Variant {
            return Err(GraphError::AssetKindMismatch {
                id: variant,
                expected: AssetKind::Variant.label(),
                found: metadata.kind.label(),
            });
        }
        let parent = self.get(new_parent)?;
        if parent.kind == AssetKind::Instance {
            return Err(GraphError::AssetKindMismatch {
                id: new_parent,
                expected: "graph or variant",
                found: parent.kind.label(),
            });
        }
        let parent_chain = self.chain(new_parent)?;
        if let Some(position) = parent_chain.iter().position(|id| *id == variant) {
            let mut chain = vec![variant];
            chain.extend_from_slice(&parent_chain[..=position]);
            return Err(GraphError::CyclicDependency { chain });
        }
        let current_root = self.root_of(variant)?;
        let new_root = parent_chain.last().copied().unwrap_or(new_parent);
        if current_root != new_root {
            return Err(GraphError::IncompatibleBase {
                variant,
                base: new_parent,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/asset_tests.rs"]
mod tests;
