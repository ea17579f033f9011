mod asset;
mod codec;
mod config;
mod error;
mod graph;
mod host;
mod id;
mod identity;
mod import;
mod instance;
mod overrides;
mod project;
mod scene;
mod storage;
mod variant;
mod version;

pub use asset::{AssetData, AssetIndex, AssetKind, AssetMetadata, Delta, ImportRef};
pub use codec::{
    CodecError, CodecRegistry, DecodeOutcome, DeferredField, Encoded, FieldData,
    FieldDescriptor, FieldIndex, FieldKind, IdentityResolver, Record, RecordLookup, RecordStream,
    ReferenceResolver, References, Resolution, SchemaError, Slot, StreamEntry, TypeCodec,
    TypeDescriptor, TypeDescriptorBuilder, Value,
};
pub use config::{
    AllocatorKind, ConfigError, GraphSection, IdentitySection, ProjectConfig, ProjectSection,
    StorageSection, CONFIG_FILE_NAME,
};
pub use error::{ConflictReason, GraphError, GraphResult, ObjectFailure, OverrideConflict};
pub use graph::{
    deserialize_graph, serialize_graph, serialize_with, Binding, GraphLoader, GraphWarning,
    LoadOptions, LoadProgress, LoadReport, RegistryPolicy, SerializedGraph, Visit, WalkPolicy,
};
pub use host::{
    downcast_mut, downcast_ref, find_by_path, HostError, LiveObject, ObjectHandle, ObjectHost,
    World,
};
pub use id::{IdAllocator, IdKind, IdParseError, ObjectId};
pub use identity::IdentityRegistry;
pub use import::{ImportError, ImportedObject, Importer, Imports};
pub use instance::{Instance, InstanceId};
pub use overrides::{diff_record, OverrideKey, OverrideRecord, OverrideSet, OverrideTracker};
pub use project::Project;
pub use scene::{
    material_fields, node_fields, register_scene_types, Material, MaterialCodec,
    MaterialImporter, SceneNode, SceneNodeCodec, MATERIAL_TYPE, SCENE_NODE_TYPE,
};
pub use storage::{
    decode_envelope, encode_envelope, read_with_recovery, BlobStore, DirectoryStore,
    MemoryStore, StorageError, StreamKind,
};
pub use variant::{
    apply_to_stream, field_value, find_conflicts, ApplyReport, Chain, RevertScope,
};
pub use version::{DATA_BINARY_MAGIC, DATA_FORMAT_VERSION, METADATA_FORMAT_VERSION};
