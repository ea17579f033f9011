//! Variant chain model: resolved chains, override layering and conflicts.
//!
//! A variant never stores a merged graph. Its effective records are rebuilt
//! from the root graph plus every delta on the chain, base-first, with the
//! nearest delta winning on equal override keys. This module holds the pure
//! parts of that computation; the project drives them against live objects.
//!
//! # Contracts
//! - **Postcondition**: [`Chain::effective`] is a pure function of the
//!   stored chain, so re-applying it is idempotent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::asset::Delta;
use crate::codec::{FieldData, RecordStream};
use crate::error::{ConflictReason, OverrideConflict};
use crate::graph::GraphWarning;
use crate::id::ObjectId;
use crate::overrides::{OverrideKey, OverrideSet};

/// Which overrides a revert discards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertScope {
    #[default]
    All,
    Fields(Vec<OverrideKey>),
}

impl RevertScope {
    pub fn includes(&self, key: &OverrideKey) -> bool {
        match self {
            RevertScope::All => true,
            RevertScope::Fields(keys) => keys.contains(key),
        }
    }
}

/// Result of writing overrides into live objects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<OverrideKey>,
    /// Overrides whose part is missing, or whose references did not resolve.
    pub dangling: Vec<GraphWarning>,
}

/// A variant chain loaded from storage, base-first.
#[derive(Clone, Debug, PartialEq)]
pub struct Chain {
    /// The graph asset at the base of the chain.
    pub root: ObjectId,
    pub base: RecordStream,
    /// Deltas of every variant or instance above the root, base-first.
    pub deltas: Vec<(ObjectId, Delta)>,
}

impl Chain {
    pub fn graph(root: ObjectId, base: RecordStream) -> Self {
        Self {
            root,
            base,
            deltas: Vec::new(),
        }
    }

    /// The nearest asset of the chain.
    pub fn tip(&self) -> ObjectId {
        self.deltas.last().map_or(self.root, |(id, _)| *id)
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        std::iter::once(self.root)
            .chain(self.deltas.iter().map(|(id, _)| *id))
            .collect()
    }

    /// Root graph records plus every added part, with no overrides applied.
    pub fn materialization(&self) -> RecordStream {
        let mut stream = self.base.clone();
        for (_, delta) in &self.deltas {
            stream.extend_from(&delta.added);
        }
        stream
    }

    /// Every override of the chain, nearest winning.
    pub fn layered(&self) -> OverrideSet {
        let mut layered = OverrideSet::new();
        for (_, delta) in &self.deltas {
            layered.layer(&delta.overrides);
        }
        layered
    }

    /// Records as they look at the tip of the chain.
    pub fn effective(&self) -> RecordStream {
        let mut stream = self.materialization();
        apply_to_stream(&mut stream, &self.layered());
        stream
    }

    /// Part ids of the whole chain.
    pub fn part_ids(&self) -> BTreeSet<ObjectId> {
        let mut ids = self.base.ids();
        for (_, delta) in &self.deltas {
            ids.extend(delta.added.ids());
        }
        ids
    }
}

/// Writes overrides into the matching stream records.
///
/// Returns the keys whose part is not in the stream.
pub fn apply_to_stream(stream: &mut RecordStream, overrides: &OverrideSet) -> Vec<OverrideKey> {
    let positions = stream.positions();
    let mut missing = Vec::new();
    for (key, value) in overrides.iter() {
        match positions.get(&key.part) {
            Some(position) => {
                stream.entries[*position]
                    .record
                    .set(key.field, value.clone());
            }
            None => missing.push(*key),
        }
    }
    missing
}

/// Value of one field in a stream, if present.
pub fn field_value(stream: &RecordStream, key: &OverrideKey) -> Option<FieldData> {
    stream
        .get(key.part)
        .and_then(|record| record.get(key.field))
        .cloned()
}

/// Overrides that cannot be pushed to the base without clobbering data.
///
/// An override conflicts when the base value differs from the one observed
/// when it was recorded, or when a saved sibling holds a different override
/// for the same key.
pub fn find_conflicts(
    overrides: &OverrideSet,
    observed: &OverrideSet,
    base: &RecordStream,
    siblings: &[(ObjectId, OverrideSet)],
) -> Vec<OverrideConflict> {
    let base = base.lookup();
    let mut conflicts = Vec::new();
    for (key, value) in overrides.iter() {
        if observed.get(key) != base.field(key.part, key.field) {
            conflicts.push(OverrideConflict {
                part: key.part,
                field: key.field,
                reason: ConflictReason::BaseMoved,
            });
            continue;
        }
        for (sibling, sibling_overrides) in siblings {
            if sibling_overrides
                .get(key)
                .is_some_and(|theirs| theirs != value)
            {
                conflicts.push(OverrideConflict {
                    part: key.part,
                    field: key.field,
                    reason: ConflictReason::Sibling(*sibling),
                });
            }
        }
    }
    conflicts
}

#[cfg(test)]
#[path = "tests/variant_tests.rs"]
mod tests;
