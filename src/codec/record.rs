//! Flat, identifier-based records and record streams.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::descriptor::{FieldIndex, FieldKind};
use crate::host::ObjectHandle;
use crate::id::ObjectId;

// =============================================================================
// Value
// =============================================================================

/// Non-reference field data.
///
/// Floats compare by bit pattern so that diffing a field against itself is
/// always clean, `NaN` included.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Floats, with integers widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(values) => Some(values),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::List(values)
    }
}

// =============================================================================
// FieldData / Slot
// =============================================================================

/// Encoded content of one field: references are identifiers, never handles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldData {
    Value(Value),
    Ref(Option<ObjectId>),
    Refs(Vec<ObjectId>),
}

impl FieldData {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldData::Value(_) => FieldKind::Value,
            FieldData::Ref(_) => FieldKind::Reference,
            FieldData::Refs(_) => FieldKind::ReferenceList,
        }
    }

    /// Identifiers named by this field, in field order.
    pub fn references(&self) -> Vec<ObjectId> {
        match self {
            FieldData::Value(_) | FieldData::Ref(None) => Vec::new(),
            FieldData::Ref(Some(id)) => vec![*id],
            FieldData::Refs(ids) => ids.clone(),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldData::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Value> for FieldData {
    fn from(value: Value) -> Self {
        FieldData::Value(value)
    }
}

/// Live content of one field as exchanged with a [`TypeCodec`](super::TypeCodec).
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Value(Value),
    Ref(Option<ObjectHandle>),
    Refs(Vec<ObjectHandle>),
}

impl Slot {
    pub fn kind(&self) -> FieldKind {
        match self {
            Slot::Value(_) => FieldKind::Value,
            Slot::Ref(_) => FieldKind::Reference,
            Slot::Refs(_) => FieldKind::ReferenceList,
        }
    }
}

impl From<Value> for Slot {
    fn from(value: Value) -> Self {
        Slot::Value(value)
    }
}

// =============================================================================
// Record
// =============================================================================

/// Flat representation of one live object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub type_name: String,
    pub type_version: u16,
    pub fields: BTreeMap<FieldIndex, FieldData>,
}

impl Record {
    pub fn new(type_name: impl Into<String>, type_version: u16) -> Self {
        Self {
            type_name: type_name.into(),
            type_version,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: FieldIndex) -> Option<&FieldData> {
        self.fields.get(&field)
    }

    pub fn set(&mut self, field: FieldIndex, data: FieldData) -> Option<FieldData> {
        self.fields.insert(field, data)
    }

    pub fn with(mut self, field: u16, data: impl Into<FieldData>) -> Self {
        self.fields.insert(FieldIndex::new(field), data.into());
        self
    }

    /// Every `(field, id)` reference in ascending field order.
    pub fn references(&self) -> impl Iterator<Item = (FieldIndex, ObjectId)> + '_ {
        self.fields
            .iter()
            .flat_map(|(index, data)| data.references().into_iter().map(move |id| (*index, id)))
    }
}

// =============================================================================
// RecordStream
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: ObjectId,
    pub record: Record,
}

/// Ordered `(id, record)` pairs plus the ids of the root parts.
///
/// Entries are in walk-completion order: reading sequentially, a reference
/// names either an earlier entry or (only for cycle-closing edges) a later
/// one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordStream {
    pub entries: Vec<StreamEntry>,
    pub roots: Vec<ObjectId>,
}

impl RecordStream {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, id: ObjectId, record: Record) {
        self.entries.push(StreamEntry { id, record });
    }

    pub fn ids(&self) -> BTreeSet<ObjectId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub fn position(&self, id: ObjectId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Record> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| &entry.record)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Record> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| &mut entry.record)
    }

    pub fn is_root(&self, id: ObjectId) -> bool {
        self.roots.contains(&id)
    }

    /// Id-keyed view for repeated lookups; build it once per pass instead of
    /// calling [`RecordStream::get`] in a loop.
    pub fn lookup(&self) -> RecordLookup<'_> {
        RecordLookup {
            stream: self,
            positions: self.positions(),
        }
    }

    /// Id to stream position; later duplicates are ignored.
    pub fn positions(&self) -> HashMap<ObjectId, usize> {
        let mut positions = HashMap::with_capacity(self.entries.len());
        for (position, entry) in self.entries.iter().enumerate() {
            positions.entry(entry.id).or_insert(position);
        }
        positions
    }

    /// Records keyed by id.
    pub fn to_map(&self) -> BTreeMap<ObjectId, Record> {
        self.entries
            .iter()
            .map(|entry| (entry.id, entry.record.clone()))
            .collect()
    }

    /// Ids referenced by the stream that are not part of it.
    pub fn external_references(&self) -> BTreeSet<ObjectId> {
        let own = self.ids();
        self.entries
            .iter()
            .flat_map(|entry| entry.record.references())
            .map(|(_, id)| id)
            .filter(|id| !own.contains(id))
            .collect()
    }

    /// Appends the entries of `other` whose ids are not present yet.
    pub fn extend_from(&mut self, other: &RecordStream) {
        let own = self.ids();
        for entry in &other.entries {
            if !own.contains(&entry.id) {
                self.entries.push(entry.clone());
            }
        }
    }

    /// One line per entry: position, id, type and references.
    pub fn summary(&self) -> String {
        let mut output = String::new();
        for (position, entry) in self.entries.iter().enumerate() {
            let marker = if self.is_root(entry.id) { "*" } else { " " };
            let _ = write!(
                output,
                "{position:>3}{marker} {} {}",
                entry.id, entry.record.type_name
            );
            for (field, target) in entry.record.references() {
                let _ = write!(output, " {field}->{target}");
            }
            output.push('\n');
        }
        output
    }
}

/// Borrowed stream with a position index, see [`RecordStream::lookup`].
#[derive(Clone, Debug)]
pub struct RecordLookup<'s> {
    stream: &'s RecordStream,
    positions: HashMap<ObjectId, usize>,
}

impl<'s> RecordLookup<'s> {
    pub fn get(&self, id: ObjectId) -> Option<&'s Record> {
        let position = *self.positions.get(&id)?;
        self.stream.entries.get(position).map(|entry| &entry.record)
    }

    pub fn field(&self, id: ObjectId, field: FieldIndex) -> Option<&'s FieldData> {
        self.get(id).and_then(|record| record.get(field))
    }

    #[inline]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.positions.contains_key(&id)
    }
}
