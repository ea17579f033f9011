//! Dependency-ordered graph serialization and loading.
//!
//! [`serialize_graph`] walks live objects depth-first in post-order and emits
//! a [`RecordStream`]; [`GraphLoader`] consumes one sequentially and
//! back-patches the forward references that only cycles produce.
//!
//! # Contracts
//! - **Invariant**: every reached object is emitted at most once, however
//!   many references point at it.
//! - **Postcondition**: a reference in a stream entry names either an
//!   earlier entry, a later entry closing a cycle, or an external id.
//! - **Postcondition**: after [`GraphLoader::finish`] no placeholder remains;
//!   unresolved references are null and listed as dangling.

mod deserialize;
mod serialize;

use std::collections::BTreeSet;
use std::fmt;

pub use deserialize::{Binding, GraphLoader, LoadOptions, LoadProgress, LoadReport};
pub use serialize::serialize_with;

use crate::codec::{CodecRegistry, FieldIndex, RecordStream};
use crate::error::{GraphResult, ObjectFailure};
use crate::host::{ObjectHandle, ObjectHost};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;

// =============================================================================
// Walk policy
// =============================================================================

/// How the walk treats one reached object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Emit a record under this id and follow the object's references.
    Descend(ObjectId),
    /// Reference by id only; the object belongs elsewhere.
    Leaf(ObjectId),
    /// Do not reference at all; the field is written as null.
    Exclude(String),
}

/// Decides, per reached object, what the serializer does with it.
pub trait WalkPolicy {
    fn classify(&mut self, host: &dyn ObjectHost, handle: ObjectHandle) -> Visit;
}

/// Descends into every object, with ids drawn from the identity registry.
#[derive(Debug)]
pub struct RegistryPolicy<'r> {
    identity: &'r mut IdentityRegistry,
}

impl<'r> RegistryPolicy<'r> {
    pub fn new(identity: &'r mut IdentityRegistry) -> Self {
        Self { identity }
    }
}

impl WalkPolicy for RegistryPolicy<'_> {
    fn classify(&mut self, host: &dyn ObjectHost, handle: ObjectHandle) -> Visit {
        if !host.contains(handle) {
            return Visit::Exclude(format!("object {handle} no longer exists"));
        }
        Visit::Descend(self.identity.get_or_create_id(handle))
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Non-fatal degradation recorded by a walk or a load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphWarning {
    Excluded {
        handle: ObjectHandle,
        reason: String,
    },
    MissingCodec {
        handle: ObjectHandle,
        type_name: String,
    },
    Dangling {
        owner: ObjectId,
        field: FieldIndex,
        target: ObjectId,
    },
    DuplicateEntry {
        id: ObjectId,
    },
    /// An override names a part the instance does not have.
    MissingPart {
        part: ObjectId,
        field: FieldIndex,
    },
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphWarning::Excluded { handle, reason } => write!(f, "{handle} excluded: {reason}"),
            GraphWarning::MissingCodec { handle, type_name } => {
                write!(f, "{handle} skipped: no codec for '{type_name}'")
            }
            GraphWarning::Dangling {
                owner,
                field,
                target,
            } => write!(f, "{owner} field {field}: dangling reference to {target}"),
            GraphWarning::DuplicateEntry { id } => write!(f, "duplicate stream entry {id}"),
            GraphWarning::MissingPart { part, field } => {
                write!(f, "override {part}:{field} names a missing part")
            }
        }
    }
}

/// Result of a graph walk.
#[derive(Debug, Default)]
pub struct SerializedGraph {
    pub stream: RecordStream,
    /// Live handle of each stream entry, by position.
    pub handles: Vec<ObjectHandle>,
    /// Ids referenced as leaves.
    pub externals: BTreeSet<ObjectId>,
    pub warnings: Vec<GraphWarning>,
    /// Non-root objects whose record could not be produced.
    pub failures: Vec<ObjectFailure>,
}

impl SerializedGraph {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Serializes the graph reachable from `roots`, naming objects through the
/// identity registry.
pub fn serialize_graph(
    host: &dyn ObjectHost,
    codecs: &CodecRegistry,
    identity: &mut IdentityRegistry,
    roots: &[ObjectHandle],
) -> GraphResult<SerializedGraph> {
    serialize_with(host, codecs, roots, &mut RegistryPolicy::new(identity))
}

/// Materializes a whole stream in one go.
pub fn deserialize_graph(
    host: &mut dyn ObjectHost,
    codecs: &CodecRegistry,
    identity: &mut IdentityRegistry,
    stream: &RecordStream,
    options: LoadOptions,
) -> GraphResult<LoadReport> {
    GraphLoader::new(stream, options).finish(host, codecs, identity)
}

#[cfg(test)]
#[path = "../tests/graph_tests.rs"]
mod tests;
