//! Type codec registry.
//!
//! A [`TypeCodec`] is the surrogate of one live type: it reads and writes
//! individual fields of a live object as [`Slot`]s. The [`CodecRegistry`]
//! builds everything else on top of that pair of primitives:
//! reference enumeration, whole-object encode/decode, and single-field writes.
//!
//! # Contracts
//! - **Invariant**: `enumerate` yields every reference field of the concrete
//!   type in ascending index order and never yields value fields.
//! - **Invariant**: each call to `enumerate` starts a fresh cursor.
//! - **Postcondition**: `encode` never embeds handles; every reference is an
//!   identifier or null.

pub mod descriptor;
pub mod record;

use std::collections::HashMap;
use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

pub use descriptor::{
    FieldDescriptor, FieldIndex, FieldKind, SchemaError, TypeDescriptor, TypeDescriptorBuilder,
};
pub use record::{FieldData, Record, RecordLookup, RecordStream, Slot, StreamEntry, Value};

use crate::error::{GraphError, GraphResult};
use crate::host::{HostError, LiveObject, ObjectHandle, ObjectHost};
use crate::id::ObjectId;

// =============================================================================
// Codec trait
// =============================================================================

#[derive(Clone, Debug, PartialEq, Error, Diagnostic)]
pub enum CodecError {
    #[error("codec for '{expected}' received an object of type '{found}'")]
    #[diagnostic(code("codec.wrong_type"))]
    WrongType { expected: String, found: String },
    #[error("type '{type_name}' has no field {field}")]
    #[diagnostic(code("codec.unknown_field"))]
    UnknownField { type_name: String, field: FieldIndex },
    #[error("field {field} is a {expected} field, got {found} data")]
    #[diagnostic(code("codec.kind_mismatch"))]
    KindMismatch {
        field: FieldIndex,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("invalid value for field {field}: {message}")]
    #[diagnostic(code("codec.invalid_value"))]
    InvalidValue { field: FieldIndex, message: String },
    #[error("record of '{type_name}' has version {found}; codec supports up to {supported}")]
    #[diagnostic(
        code("codec.unsupported_version"),
        help("the record was written by a newer build; upgrade the codec")
    )]
    UnsupportedVersion {
        type_name: String,
        found: u16,
        supported: u16,
    },
    #[error("{0}")]
    #[diagnostic(code("codec.custom"))]
    Custom(String),
}

impl CodecError {
    pub fn invalid(field: FieldIndex, message: impl Into<String>) -> Self {
        CodecError::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Surrogate for one live type.
pub trait TypeCodec: Send + Sync {
    fn descriptor(&self) -> &TypeDescriptor;

    /// Reads one declared field from a live object.
    fn read(&self, object: &dyn LiveObject, field: FieldIndex) -> Result<Slot, CodecError>;

    /// Writes one declared field into a live object.
    fn write(
        &self,
        object: &mut dyn LiveObject,
        field: FieldIndex,
        slot: Slot,
    ) -> Result<(), CodecError>;

    /// Brings a record written by an older type version up to date.
    ///
    /// The default accepts older records unchanged (append-only fields make
    /// that safe) and rejects records newer than the descriptor.
    fn upgrade(&self, mut record: Record) -> Result<Record, CodecError> {
        let descriptor = self.descriptor();
        if record.type_version > descriptor.version() {
            return Err(CodecError::UnsupportedVersion {
                type_name: record.type_name,
                found: record.type_version,
                supported: descriptor.version(),
            });
        }
        record.type_version = descriptor.version();
        Ok(record)
    }
}

// =============================================================================
// Resolvers
// =============================================================================

/// Maps live handles to identifiers while encoding.
pub trait IdentityResolver {
    /// `None` leaves the reference null and reports it as unresolved.
    fn id_for(&mut self, handle: ObjectHandle) -> Option<ObjectId>;
}

impl<F> IdentityResolver for F
where
    F: FnMut(ObjectHandle) -> Option<ObjectId>,
{
    fn id_for(&mut self, handle: ObjectHandle) -> Option<ObjectId> {
        self(handle)
    }
}

/// Outcome of resolving an identifier while decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Ready(ObjectHandle),
    /// Materialized later in the same pass; the field is back-patched.
    Pending,
    Dangling,
}

/// Maps identifiers to live handles while decoding.
pub trait ReferenceResolver {
    fn resolve(&mut self, id: ObjectId) -> Resolution;
}

impl<F> ReferenceResolver for F
where
    F: FnMut(ObjectId) -> Resolution,
{
    fn resolve(&mut self, id: ObjectId) -> Resolution {
        self(id)
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Encoded {
    pub record: Record,
    /// References whose target had no identifier; encoded as null.
    pub unresolved: Vec<(FieldIndex, ObjectHandle)>,
}

/// A reference field waiting for targets materialized later in the pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredField {
    pub field: FieldIndex,
    pub kind: FieldKind,
    pub targets: Vec<ObjectId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub deferred: Vec<DeferredField>,
    pub dangling: Vec<(FieldIndex, ObjectId)>,
}

// =============================================================================
// Reference enumeration
// =============================================================================

/// Lazy cursor over the outgoing references of one object.
pub struct References<'a> {
    codec: &'a dyn TypeCodec,
    object: &'a dyn LiveObject,
    fields: std::slice::Iter<'a, FieldDescriptor>,
    pending: std::vec::IntoIter<(FieldIndex, ObjectHandle)>,
}

impl fmt::Debug for References<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("References")
            .field("type_name", &self.codec.descriptor().name())
            .finish_non_exhaustive()
    }
}

impl Iterator for References<'_> {
    type Item = Result<(FieldIndex, ObjectHandle), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(Ok(item));
            }
            let field = self.fields.find(|field| field.kind.is_reference())?;
            let slot = match self.codec.read(self.object, field.index) {
                Ok(slot) => slot,
                Err(err) => return Some(Err(err)),
            };
            let targets = match slot {
                Slot::Ref(target) => target.into_iter().collect(),
                Slot::Refs(targets) => targets,
                Slot::Value(_) => {
                    return Some(Err(CodecError::KindMismatch {
                        field: field.index,
                        expected: field.kind,
                        found: FieldKind::Value,
                    }))
                }
            };
            let index = field.index;
            self.pending = targets
                .into_iter()
                .map(|target| (index, target))
                .collect::<Vec<_>>()
                .into_iter();
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Open table of codecs keyed by type name.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Box<dyn TypeCodec>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("CodecRegistry")
            .field("types", &names)
            .finish()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: TypeCodec + 'static>(&mut self, codec: C) -> GraphResult<()> {
        let name = codec.descriptor().name().to_string();
        if self.codecs.contains_key(&name) {
            return Err(GraphError::DuplicateCodec(name));
        }
        self.codecs.insert(name, Box::new(codec));
        Ok(())
    }

    /// Swaps in a newer codec for an already registered type.
    ///
    /// The new descriptor must be a legal evolution of the current one.
    pub fn replace<C: TypeCodec + 'static>(&mut self, codec: C) -> GraphResult<()> {
        let name = codec.descriptor().name().to_string();
        let current = self
            .codecs
            .get(&name)
            .ok_or_else(|| GraphError::MissingCodec(name.clone()))?;
        codec.descriptor().check_evolution(current.descriptor())?;
        self.codecs.insert(name, Box::new(codec));
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.codecs.contains_key(type_name)
    }

    pub fn codec(&self, type_name: &str) -> GraphResult<&dyn TypeCodec> {
        self.codecs
            .get(type_name)
            .map(|codec| codec.as_ref())
            .ok_or_else(|| GraphError::MissingCodec(type_name.to_string()))
    }

    pub fn descriptor(&self, type_name: &str) -> GraphResult<&TypeDescriptor> {
        Ok(self.codec(type_name)?.descriptor())
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Codec for the live object behind `handle`.
    pub fn codec_for<'h>(
        &self,
        host: &'h dyn ObjectHost,
        handle: ObjectHandle,
    ) -> GraphResult<(&dyn TypeCodec, &'h dyn LiveObject)> {
        let object = host
            .object(handle)
            .ok_or(GraphError::Host(HostError::StaleHandle(handle)))?;
        Ok((self.codec(object.type_name())?, object))
    }

    /// Outgoing references of one object.
    pub fn enumerate<'a>(
        &'a self,
        host: &'a dyn ObjectHost,
        handle: ObjectHandle,
    ) -> GraphResult<References<'a>> {
        let (codec, object) = self.codec_for(host, handle)?;
        Ok(References {
            codec,
            object,
            fields: codec.descriptor().fields().iter(),
            pending: Vec::new().into_iter(),
        })
    }

    /// Encodes one live object into a record.
    pub fn encode(
        &self,
        host: &dyn ObjectHost,
        handle: ObjectHandle,
        resolver: &mut dyn IdentityResolver,
    ) -> GraphResult<Encoded> {
        let (codec, object) = self.codec_for(host, handle)?;
        let descriptor = codec.descriptor();
        let type_error = |source| GraphError::Codec {
            type_name: descriptor.name().to_string(),
            source,
        };
        let mut record = Record::new(descriptor.name(), descriptor.version());
        let mut unresolved = Vec::new();
        for field in descriptor.fields() {
            let slot = codec.read(object, field.index).map_err(type_error)?;
            if slot.kind() != field.kind {
                return Err(type_error(CodecError::KindMismatch {
                    field: field.index,
                    expected: field.kind,
                    found: slot.kind(),
                }));
            }
            let data = match slot {
                Slot::Value(value) => FieldData::Value(value),
                Slot::Ref(None) => FieldData::Ref(None),
                Slot::Ref(Some(target)) => {
                    let id = resolver.id_for(target);
                    if id.is_none() {
                        unresolved.push((field.index, target));
                    }
                    FieldData::Ref(id)
                }
                Slot::Refs(targets) => {
                    let mut ids = Vec::with_capacity(targets.len());
                    for target in targets {
                        match resolver.id_for(target) {
                            Some(id) => ids.push(id),
                            None => unresolved.push((field.index, target)),
                        }
                    }
                    FieldData::Refs(ids)
                }
            };
            record.fields.insert(field.index, data);
        }
        Ok(Encoded { record, unresolved })
    }

    /// Decodes a record into an already constructed object of the same type.
    ///
    /// References that are not yet materialized are left null and returned as
    /// deferred fields for the caller to back-patch.
    pub fn decode(
        &self,
        host: &mut dyn ObjectHost,
        handle: ObjectHandle,
        record: &Record,
        resolver: &mut dyn ReferenceResolver,
    ) -> GraphResult<DecodeOutcome> {
        let codec = self.codec(&record.type_name)?;
        let type_error = |source| GraphError::Codec {
            type_name: record.type_name.clone(),
            source,
        };
        let record = if record.type_version == codec.descriptor().version() {
            std::borrow::Cow::Borrowed(record)
        } else {
            std::borrow::Cow::Owned(codec.upgrade(record.clone()).map_err(type_error)?)
        };
        let object = host
            .object_mut(handle)
            .ok_or(GraphError::Host(HostError::StaleHandle(handle)))?;
        if object.type_name() != record.type_name {
            return Err(type_error(CodecError::WrongType {
                expected: record.type_name.clone(),
                found: object.type_name().to_string(),
            }));
        }

        let mut outcome = DecodeOutcome::default();
        for (index, data) in &record.fields {
            let field = checked_field(codec.descriptor(), *index, data).map_err(type_error)?;
            let slot = match data {
                FieldData::Value(value) => Slot::Value(value.clone()),
                FieldData::Ref(None) => Slot::Ref(None),
                FieldData::Ref(Some(id)) => match resolver.resolve(*id) {
                    Resolution::Ready(target) => Slot::Ref(Some(target)),
                    Resolution::Pending => {
                        outcome.deferred.push(DeferredField {
                            field: field.index,
                            kind: field.kind,
                            targets: vec![*id],
                        });
                        Slot::Ref(None)
                    }
                    Resolution::Dangling => {
                        outcome.dangling.push((field.index, *id));
                        Slot::Ref(None)
                    }
                },
                FieldData::Refs(ids) => {
                    let mut ready = Vec::with_capacity(ids.len());
                    let mut waiting = false;
                    let mut kept = Vec::with_capacity(ids.len());
                    for id in ids {
                        match resolver.resolve(*id) {
                            Resolution::Ready(target) => {
                                ready.push(target);
                                kept.push(*id);
                            }
                            Resolution::Pending => {
                                waiting = true;
                                kept.push(*id);
                            }
                            Resolution::Dangling => outcome.dangling.push((field.index, *id)),
                        }
                    }
                    if waiting {
                        outcome.deferred.push(DeferredField {
                            field: field.index,
                            kind: field.kind,
                            targets: kept,
                        });
                    }
                    Slot::Refs(ready)
                }
            };
            codec.write(object, field.index, slot).map_err(type_error)?;
        }
        Ok(outcome)
    }

    /// Writes one slot into a live object; used to back-patch deferred fields.
    pub fn patch(
        &self,
        host: &mut dyn ObjectHost,
        handle: ObjectHandle,
        field: FieldIndex,
        slot: Slot,
    ) -> GraphResult<()> {
        let object = host
            .object_mut(handle)
            .ok_or(GraphError::Host(HostError::StaleHandle(handle)))?;
        let codec = self.codec(object.type_name())?;
        codec
            .write(object, field, slot)
            .map_err(|source| GraphError::Codec {
                type_name: codec.descriptor().name().to_string(),
                source,
            })
    }

    /// Decodes a single encoded field into a live object.
    ///
    /// Identifiers that do not resolve to a live object are dropped (null
    /// for single references) and returned.
    pub fn write_field(
        &self,
        host: &mut dyn ObjectHost,
        handle: ObjectHandle,
        field: FieldIndex,
        data: &FieldData,
        resolver: &mut dyn ReferenceResolver,
    ) -> GraphResult<Vec<ObjectId>> {
        let type_name = host
            .object(handle)
            .ok_or(GraphError::Host(HostError::StaleHandle(handle)))?
            .type_name();
        let codec = self.codec(type_name)?;
        let type_error = |source| GraphError::Codec {
            type_name: type_name.to_string(),
            source,
        };
        let descriptor = checked_field(codec.descriptor(), field, data).map_err(type_error)?;
        let mut missing = Vec::new();
        let mut lookup = |id: ObjectId| match resolver.resolve(id) {
            Resolution::Ready(target) => Some(target),
            Resolution::Pending | Resolution::Dangling => {
                missing.push(id);
                None
            }
        };
        let slot = match data {
            FieldData::Value(value) => Slot::Value(value.clone()),
            FieldData::Ref(target) => Slot::Ref(target.and_then(&mut lookup)),
            FieldData::Refs(ids) => Slot::Refs(ids.iter().filter_map(|id| lookup(*id)).collect()),
        };
        let object = host
            .object_mut(handle)
            .ok_or(GraphError::Host(HostError::StaleHandle(handle)))?;
        codec
            .write(object, descriptor.index, slot)
            .map_err(type_error)?;
        Ok(missing)
    }
}

fn checked_field<'d>(
    descriptor: &'d TypeDescriptor,
    index: FieldIndex,
    data: &FieldData,
) -> Result<&'d FieldDescriptor, CodecError> {
    let field = descriptor
        .field(index)
        .ok_or_else(|| CodecError::UnknownField {
            type_name: descriptor.name().to_string(),
            field: index,
        })?;
    if field.kind != data.kind() {
        return Err(CodecError::KindMismatch {
            field: index,
            expected: field.kind,
            found: data.kind(),
        });
    }
    Ok(field)
}

#[cfg(test)]
#[path = "../tests/codec_tests.rs"]
mod tests;
