//! Type descriptors: the versioned field layout of one live type.
//!
//! # Contracts
//! - **Invariant**: field indices are unique within a descriptor and fields
//!   are kept in ascending index order.
//! - **Invariant**: indices are append-only across versions; see
//!   [`TypeDescriptor::check_evolution`].

use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable small-integer index of a field within its type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct FieldIndex(u16);

impl FieldIndex {
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FieldIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Plain data, never followed by the graph walk.
    Value,
    /// A single, possibly null, reference to another object.
    Reference,
    /// An ordered list of references.
    ReferenceList,
}

impl FieldKind {
    #[inline]
    pub fn is_reference(self) -> bool {
        !matches!(self, FieldKind::Value)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldKind::Value => "value",
            FieldKind::Reference => "reference",
            FieldKind::ReferenceList => "reference list",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub index: FieldIndex,
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum SchemaError {
    #[error("type name must not be empty")]
    #[diagnostic(code("schema.empty_name"))]
    EmptyTypeName,
    #[error("type '{type_name}' declares field index {index} twice")]
    #[diagnostic(code("schema.duplicate_index"))]
    DuplicateIndex { type_name: String, index: FieldIndex },
    #[error("type '{type_name}' declares field name '{name}' twice")]
    #[diagnostic(code("schema.duplicate_name"))]
    DuplicateName { type_name: String, name: String },
    #[error("type '{type_name}' dropped field {index} ('{name}')")]
    #[diagnostic(
        code("schema.field_removed"),
        help("field indices are append-only; keep the old field and add a new index")
    )]
    FieldRemoved {
        type_name: String,
        index: FieldIndex,
        name: String,
    },
    #[error("type '{type_name}' changed field {index}: was '{was}', now '{now}'")]
    #[diagnostic(
        code("schema.field_changed"),
        help("never reuse or reorder a field index once records have been written")
    )]
    FieldChanged {
        type_name: String,
        index: FieldIndex,
        was: String,
        now: String,
    },
    #[error("type '{type_name}' version went from {previous} to {current}")]
    #[diagnostic(code("schema.version_regressed"))]
    VersionRegressed {
        type_name: String,
        previous: u16,
        current: u16,
    },
    #[error("cannot compare '{current}' against descriptor of '{previous}'")]
    #[diagnostic(code("schema.type_mismatch"))]
    TypeMismatch { previous: String, current: String },
}

/// Declared layout of one live type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    name: String,
    version: u16,
    fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    pub fn builder(name: impl Into<String>) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            name: name.into(),
            version: 1,
            fields: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// All fields, ascending by index.
    #[inline]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, index: FieldIndex) -> Option<&FieldDescriptor> {
        self.fields
            .binary_search_by_key(&index, |field| field.index)
            .ok()
            .map(|position| &self.fields[position])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.kind.is_reference())
    }

    pub fn value_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| !field.kind.is_reference())
    }

    /// Verifies that `self` is a legal successor of `previous`.
    ///
    /// Every previously declared field must survive with the same index,
    /// name and kind; new fields may only be appended, and the version may
    /// not go backwards.
    pub fn check_evolution(&self, previous: &TypeDescriptor) -> Result<(), SchemaError> {
        if self.name != previous.name {
            return Err(SchemaError::TypeMismatch {
                previous: previous.name.clone(),
                current: self.name.clone(),
            });
        }
        if self.version < previous.version {
            return Err(SchemaError::VersionRegressed {
                type_name: self.name.clone(),
                previous: previous.version,
                current: self.version,
            });
        }
        for old in &previous.fields {
            let Some(new) = self.field(old.index) else {
                return Err(SchemaError::FieldRemoved {
                    type_name: self.name.clone(),
                    index: old.index,
                    name: old.name.clone(),
                });
            };
            if new.name != old.name || new.kind != old.kind {
                return Err(SchemaError::FieldChanged {
                    type_name: self.name.clone(),
                    index: old.index,
                    was: format!("{} ({})", old.name, old.kind),
                    now: format!("{} ({})", new.name, new.kind),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TypeDescriptorBuilder {
    name: String,
    version: u16,
    fields: Vec<FieldDescriptor>,
}

impl TypeDescriptorBuilder {
    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn value(self, index: u16, name: impl Into<String>) -> Self {
        self.field(index, name, FieldKind::Value)
    }

    pub fn reference(self, index: u16, name: impl Into<String>) -> Self {
        self.field(index, name, FieldKind::Reference)
    }

    pub fn reference_list(self, index: u16, name: impl Into<String>) -> Self {
        self.field(index, name, FieldKind::ReferenceList)
    }

    pub fn field(mut self, index: u16, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            index: FieldIndex::new(index),
            name: name.into(),
            kind,
        });
        self
    }

    pub fn build(mut self) -> Result<TypeDescriptor, SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyTypeName);
        }
        self.fields.sort_by_key(|field| field.index);
        for pair in self.fields.windows(2) {
            if pair[0].index == pair[1].index {
                return Err(SchemaError::DuplicateIndex {
                    type_name: self.name,
                    index: pair[0].index,
                });
            }
        }
        for (position, field) in self.fields.iter().enumerate() {
            if self.fields[..position]
                .iter()
                .any(|other| other.name == field.name)
            {
                return Err(SchemaError::DuplicateName {
                    type_name: self.name.clone(),
                    name: field.name.clone(),
                });
            }
        }
        Ok(TypeDescriptor {
            name: self.name,
            version: self.version,
            fields: self.fields,
        })
    }
}
