//! Override tracking: dirty marking and per-field diffs against base records.
//!
//! # Contracts
//! - **Invariant**: at most one override exists per `(part, field)` key.
//! - **Postcondition**: [`diff_record`] yields one override per differing
//!   field and none for unchanged fields.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{FieldData, FieldIndex, Record};
use crate::host::ObjectHandle;
use crate::id::ObjectId;
use crate::instance::InstanceId;

// =============================================================================
// Override records
// =============================================================================

/// Key of one override: an asset part and one of its fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverrideKey {
    pub part: ObjectId,
    pub field: FieldIndex,
}

impl OverrideKey {
    pub fn new(part: ObjectId, field: FieldIndex) -> Self {
        Self { part, field }
    }
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.part, self.field)
    }
}

/// One per-field divergence from a base record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub part: ObjectId,
    pub field: FieldIndex,
    pub value: FieldData,
}

impl OverrideRecord {
    pub fn key(&self) -> OverrideKey {
        OverrideKey::new(self.part, self.field)
    }
}

/// Ordered set of overrides, unique per key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<OverrideRecord>", into = "Vec<OverrideRecord>")]
pub struct OverrideSet {
    entries: BTreeMap<OverrideKey, FieldData>,
}

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; returns the previous value for the key.
    pub fn insert(&mut self, key: OverrideKey, value: FieldData) -> Option<FieldData> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &OverrideKey) -> Option<&FieldData> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &OverrideKey) -> Option<FieldData> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &OverrideKey) -> bool {
        self.entries.contains_key(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OverrideKey, &FieldData)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &OverrideKey> {
        self.entries.keys()
    }

    /// Keys belonging to one part.
    pub fn keys_for(&self, part: ObjectId) -> Vec<OverrideKey> {
        self.entries
            .keys()
            .filter(|key| key.part == part)
            .copied()
            .collect()
    }

    pub fn parts(&self) -> BTreeSet<ObjectId> {
        self.entries.keys().map(|key| key.part).collect()
    }

    pub fn records(&self) -> Vec<OverrideRecord> {
        self.entries
            .iter()
            .map(|(key, value)| OverrideRecord {
                part: key.part,
                field: key.field,
                value: value.clone(),
            })
            .collect()
    }

    /// Lays `nearer` over `self`; on equal keys `nearer` wins.
    pub fn layer(&mut self, nearer: &OverrideSet) {
        for (key, value) in &nearer.entries {
            self.entries.insert(*key, value.clone());
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&OverrideKey, &FieldData) -> bool) {
        self.entries.retain(|key, value| keep(key, value));
    }
}

impl From<Vec<OverrideRecord>> for OverrideSet {
    fn from(records: Vec<OverrideRecord>) -> Self {
        records.into_iter().collect()
    }
}

impl From<OverrideSet> for Vec<OverrideRecord> {
    fn from(set: OverrideSet) -> Self {
        set.entries
            .into_iter()
            .map(|(key, value)| OverrideRecord {
                part: key.part,
                field: key.field,
                value,
            })
            .collect()
    }
}

impl FromIterator<OverrideRecord> for OverrideSet {
    fn from_iter<I: IntoIterator<Item = OverrideRecord>>(records: I) -> Self {
        let mut set = OverrideSet::new();
        for record in records {
            set.insert(record.key(), record.value);
        }
        set
    }
}

/// Per-field diff of a live record against the base record of the same part.
///
/// A field absent from `base` always differs. When the type changed every
/// live field differs.
pub fn diff_record(part: ObjectId, live: &Record, base: &Record) -> Vec<OverrideRecord> {
    let same_type = live.type_name == base.type_name;
    live.fields
        .iter()
        .filter(|(field, value)| !same_type || base.get(**field) != Some(*value))
        .map(|(field, value)| OverrideRecord {
            part,
            field: *field,
            value: value.clone(),
        })
        .collect()
}

// =============================================================================
// Dirty tracking
// =============================================================================

/// Process-local dirty set plus the owning instance of every tracked object.
#[derive(Debug, Default)]
pub struct OverrideTracker {
    dirty: BTreeSet<ObjectHandle>,
    owners: HashMap<ObjectHandle, InstanceId>,
}

impl OverrideTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags an object as changed. Returns false if it already was.
    pub fn mark_dirty(&mut self, handle: ObjectHandle) -> bool {
        self.dirty.insert(handle)
    }

    pub fn is_dirty(&self, handle: ObjectHandle) -> bool {
        self.dirty.contains(&handle)
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Records which instance an object belongs to.
    pub fn track(&mut self, handle: ObjectHandle, instance: InstanceId) {
        self.owners.insert(handle, instance);
    }

    /// Forgets an object entirely, including its dirty flag.
    pub fn untrack(&mut self, handle: ObjectHandle) {
        self.owners.remove(&handle);
        self.dirty.remove(&handle);
    }

    pub fn owner(&self, handle: ObjectHandle) -> Option<InstanceId> {
        self.owners.get(&handle).copied()
    }

    /// Dirty objects owned by `instance`, in handle order.
    pub fn dirty_for(&self, instance: InstanceId) -> Vec<ObjectHandle> {
        self.dirty
            .iter()
            .filter(|handle| self.owners.get(handle) == Some(&instance))
            .copied()
            .collect()
    }

    /// Clears the dirty flag of consumed objects.
    pub fn clear(&mut self, handles: &[ObjectHandle]) {
        for handle in handles {
            self.dirty.remove(handle);
        }
    }

    /// Instances with at least one dirty object.
    pub fn dirty_instances(&self) -> BTreeSet<InstanceId> {
        self.dirty
            .iter()
            .filter_map(|handle| self.owners.get(handle).copied())
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/overrides_tests.rs"]
mod tests;
