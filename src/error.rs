use miette::Diagnostic;
use thiserror::Error;

use crate::codec::{CodecError, FieldIndex, SchemaError};
use crate::host::{HostError, ObjectHandle};
use crate::id::ObjectId;
use crate::import::ImportError;
use crate::instance::InstanceId;
use crate::storage::StorageError;

pub type GraphResult<T> = Result<T, GraphError>;

/// One field that cannot be pushed to the base without clobbering data.
#[derive(Clone, Debug, PartialEq)]
pub struct OverrideConflict {
    pub part: ObjectId,
    pub field: FieldIndex,
    pub reason: ConflictReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    /// The base value changed after the override was recorded.
    BaseMoved,
    /// A saved sibling instance holds a different override for the same field.
    Sibling(ObjectId),
}

impl std::fmt::Display for OverrideConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            ConflictReason::BaseMoved => {
                write!(f, "{}:{} (base changed since override)", self.part, self.field)
            }
            ConflictReason::Sibling(instance) => write!(
                f,
                "{}:{} (saved instance {instance} holds a different override)",
                self.part, self.field
            ),
        }
    }
}

/// Per-object failure collected during a multi-object walk or load.
#[derive(Debug)]
pub struct ObjectFailure {
    pub id: Option<ObjectId>,
    pub handle: Option<ObjectHandle>,
    pub error: GraphError,
}

impl std::fmt::Display for ObjectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.id, self.handle) {
            (Some(id), _) => write!(f, "{id}: {}", self.error),
            (None, Some(handle)) => write!(f, "{handle}: {}", self.error),
            (None, None) => write!(f, "{}", self.error),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("no codec registered for type '{0}'")]
    #[diagnostic(code("graph.missing_codec"), help("register the type's codec at startup"))]
    MissingCodec(String),
    #[error("a codec for type '{0}' is already registered")]
    #[diagnostic(code("graph.duplicate_codec"))]
    DuplicateCodec(String),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaError),
    #[error("codec for '{type_name}' failed: {source}")]
    #[diagnostic(code("graph.codec"))]
    Codec {
        type_name: String,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    #[diagnostic(transparent)]
    Host(#[from] HostError),
    #[error("reference to {id} could not be resolved")]
    #[diagnostic(code("graph.dangling_reference"))]
    DanglingReference { id: ObjectId },
    #[error("variant chain would become cyclic: {}", format_chain(.chain))]
    #[diagnostic(code("graph.cyclic_dependency"))]
    CyclicDependency { chain: Vec<ObjectId> },
    #[error("instance {instance} cannot apply to base: {}", format_conflicts(.conflicts))]
    #[diagnostic(
        code("graph.conflicting_override"),
        help("check can_apply_to_base first, or revert the conflicting fields")
    )]
    ConflictingOverride {
        instance: InstanceId,
        conflicts: Vec<OverrideConflict>,
    },
    #[error("identifier {id} is bound to {existing}; refusing to bind {incoming}")]
    #[diagnostic(
        code("graph.identity_collision"),
        help("two live objects claim one persistent id; the registry or a record is corrupt")
    )]
    IdentityCollision {
        id: ObjectId,
        existing: ObjectHandle,
        incoming: ObjectHandle,
    },
    #[error("object {handle} already has identifier {existing}; refusing {incoming}")]
    #[diagnostic(code("graph.identity_rebind"))]
    IdentityRebind {
        handle: ObjectHandle,
        existing: ObjectId,
        incoming: ObjectId,
    },
    #[error("graph walk failed for {} object(s): {}", .failures.len(), format_failures(.failures))]
    #[diagnostic(code("graph.partial_graph"))]
    PartialGraph { failures: Vec<ObjectFailure> },
    #[error("unknown asset {0}")]
    #[diagnostic(code("graph.unknown_asset"))]
    UnknownAsset(ObjectId),
    #[error("asset {0} is not open")]
    #[diagnostic(code("graph.asset_not_open"))]
    AssetNotOpen(ObjectId),
    #[error("unknown instance {0}")]
    #[diagnostic(code("graph.unknown_instance"))]
    UnknownInstance(InstanceId),
    #[error("object {0} is not tracked by this project")]
    #[diagnostic(code("graph.unknown_object"))]
    UnknownObject(ObjectHandle),
    #[error("instance {0} is detached from its asset")]
    #[diagnostic(code("graph.detached_instance"))]
    DetachedInstance(InstanceId),
    #[error("asset {id} is a {found} asset; expected {expected}")]
    #[diagnostic(code("graph.asset_kind"))]
    AssetKindMismatch {
        id: ObjectId,
        expected: &'static str,
        found: &'static str,
    },
    #[error("asset {id} is still used by {}", format_chain(.users))]
    #[diagnostic(code("graph.asset_in_use"))]
    AssetInUse { id: ObjectId, users: Vec<ObjectId> },
    #[error("variant {variant} cannot be rebased onto {base}: different root asset")]
    #[diagnostic(code("graph.incompatible_base"))]
    IncompatibleBase { variant: ObjectId, base: ObjectId },
    #[error("object {0} already belongs to an asset or instance")]
    #[diagnostic(code("graph.already_owned"))]
    AlreadyOwned(ObjectHandle),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Import(#[from] ImportError),
}

impl GraphError {
    pub fn codec(type_name: impl Into<String>, source: CodecError) -> Self {
        GraphError::Codec {
            type_name: type_name.into(),
            source,
        }
    }

    /// True for the members that signal a broken internal invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GraphError::IdentityCollision { .. } | GraphError::IdentityRebind { .. }
        )
    }
}

fn format_chain(ids: &[ObjectId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_conflicts(conflicts: &[OverrideConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_failures(failures: &[ObjectFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
