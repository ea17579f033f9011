//! Bundled scene types and their codecs.
//!
//! `SceneNode` and `Material` are small but complete live types: they have
//! value fields, single references, reference lists and parent
//! back-references, so every graph shape the codec supports can be built
//! from them.

use crate::codec::{CodecError, CodecRegistry, FieldIndex, Slot, TypeCodec, TypeDescriptor, Value};
use crate::error::GraphResult;
use crate::host::{downcast_mut, downcast_ref, LiveObject, ObjectHandle, ObjectHost, World};
use crate::import::{ImportError, Importer};
use crate::live_object_any;

pub const SCENE_NODE_TYPE: &str = "scene.node";
pub const MATERIAL_TYPE: &str = "scene.material";

// =============================================================================
// SceneNode
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneNode {
    pub name: String,
    pub parent: Option<ObjectHandle>,
    pub children: Vec<ObjectHandle>,
    pub position: [f64; 3],
    pub visible: bool,
    /// Free reference to any other object, e.g. a camera target.
    pub link: Option<ObjectHandle>,
    pub tags: Vec<String>,
    pub material: Option<ObjectHandle>,
}

impl SceneNode {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            ..Self::default()
        }
    }
}

impl LiveObject for SceneNode {
    fn type_name(&self) -> &'static str {
        SCENE_NODE_TYPE
    }

    live_object_any!();

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn children(&self) -> Vec<ObjectHandle> {
        self.children.clone()
    }
}

pub mod node_fields {
    use crate::codec::FieldIndex;

    pub const NAME: FieldIndex = FieldIndex::new(0);
    pub const PARENT: FieldIndex = FieldIndex::new(1);
    pub const CHILDREN: FieldIndex = FieldIndex::new(2);
    pub const POSITION: FieldIndex = FieldIndex::new(3);
    pub const VISIBLE: FieldIndex = FieldIndex::new(4);
    pub const LINK: FieldIndex = FieldIndex::new(5);
    pub const TAGS: FieldIndex = FieldIndex::new(6);
    pub const MATERIAL: FieldIndex = FieldIndex::new(7);
}

#[derive(Debug)]
pub struct SceneNodeCodec {
    descriptor: TypeDescriptor,
}

impl SceneNodeCodec {
    pub fn new() -> GraphResult<Self> {
        let descriptor = TypeDescriptor::builder(SCENE_NODE_TYPE)
            .version(1)
            .value(0, "name")
            .reference(1, "parent")
            .reference_list(2, "children")
            .value(3, "position")
            .value(4, "visible")
            .reference(5, "link")
            .value(6, "tags")
            .reference(7, "material")
            .build()?;
        Ok(Self { descriptor })
    }
}

impl TypeCodec for SceneNodeCodec {
    fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    fn read(&self, object: &dyn LiveObject, field: FieldIndex) -> Result<Slot, CodecError> {
        use node_fields::*;
        let node = typed::<SceneNode>(object, SCENE_NODE_TYPE)?;
        Ok(match field {
            NAME => Slot::Value(Value::Text(node.name.clone())),
            PARENT => Slot::Ref(node.parent),
            CHILDREN => Slot::Refs(node.children.clone()),
            POSITION => Slot::Value(Value::List(
                node.position.iter().copied().map(Value::Float).collect(),
            )),
            VISIBLE => Slot::Value(Value::Bool(node.visible)),
            LINK => Slot::Ref(node.link),
            TAGS => Slot::Value(Value::List(
                node.tags.iter().cloned().map(Value::Text).collect(),
            )),
            MATERIAL => Slot::Ref(node.material),
            other => return Err(unknown(SCENE_NODE_TYPE, other)),
        })
    }

    fn write(
        &self,
        object: &mut dyn LiveObject,
        field: FieldIndex,
        slot: Slot,
    ) -> Result<(), CodecError> {
        use node_fields::*;
        let node = typed_mut::<SceneNode>(object, SCENE_NODE_TYPE)?;
        match (field, slot) {
            (NAME, Slot::Value(value)) => node.name = text(field, value)?,
            (PARENT, Slot::Ref(target)) => node.parent = target,
            (CHILDREN, Slot::Refs(targets)) => node.children = targets,
            (POSITION, Slot::Value(value)) => node.position = vector::<3>(field, value)?,
            (VISIBLE, Slot::Value(value)) => {
                node.visible = value
                    .as_bool()
                    .ok_or_else(|| CodecError::invalid(field, "expected a boolean"))?
            }
            (LINK, Slot::Ref(target)) => node.link = target,
            (TAGS, Slot::Value(value)) => node.tags = texts(field, value)?,
            (MATERIAL, Slot::Ref(target)) => node.material = target,
            (field, slot) => return Err(mismatch(&self.descriptor, field, &slot)),
        }
        Ok(())
    }
}

// =============================================================================
// Material
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Material {
    pub name: String,
    pub color: [f64; 4],
    pub texture: Option<ObjectHandle>,
}

impl Material {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: [1.0, 1.0, 1.0, 1.0],
            texture: None,
        }
    }
}

impl LiveObject for Material {
    fn type_name(&self) -> &'static str {
        MATERIAL_TYPE
    }

    live_object_any!();

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

pub mod material_fields {
    use crate::codec::FieldIndex;

    pub const NAME: FieldIndex = FieldIndex::new(0);
    pub const COLOR: FieldIndex = FieldIndex::new(1);
    pub const TEXTURE: FieldIndex = FieldIndex::new(2);
}

#[derive(Debug)]
pub struct MaterialCodec {
    descriptor: TypeDescriptor,
}

impl MaterialCodec {
    pub fn new() -> GraphResult<Self> {
        let descriptor = TypeDescriptor::builder(MATERIAL_TYPE)
            .value(0, "name")
            .value(1, "color")
            .reference(2, "texture")
            .build()?;
        Ok(Self { descriptor })
    }
}

impl TypeCodec for MaterialCodec {
    fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    fn read(&self, object: &dyn LiveObject, field: FieldIndex) -> Result<Slot, CodecError> {
        use material_fields::*;
        let material = typed::<Material>(object, MATERIAL_TYPE)?;
        Ok(match field {
            NAME => Slot::Value(Value::Text(material.name.clone())),
            COLOR => Slot::Value(Value::List(
                material.color.iter().copied().map(Value::Float).collect(),
            )),
            TEXTURE => Slot::Ref(material.texture),
            other => return Err(unknown(MATERIAL_TYPE, other)),
        })
    }

    fn write(
        &self,
        object: &mut dyn LiveObject,
        field: FieldIndex,
        slot: Slot,
    ) -> Result<(), CodecError> {
        use material_fields::*;
        let material = typed_mut::<Material>(object, MATERIAL_TYPE)?;
        match (field, slot) {
            (NAME, Slot::Value(value)) => material.name = text(field, value)?,
            (COLOR, Slot::Value(value)) => material.color = vector::<4>(field, value)?,
            (TEXTURE, Slot::Ref(target)) => material.texture = target,
            (field, slot) => return Err(mismatch(&self.descriptor, field, &slot)),
        }
        Ok(())
    }
}

/// Imports `material:<name>` keys as plain white materials.
#[derive(Debug, Default)]
pub struct MaterialImporter {
    loaded: usize,
}

impl MaterialImporter {
    pub const PREFIX: &'static str = "material:";

    pub fn loaded(&self) -> usize {
        self.loaded
    }
}

impl Importer for MaterialImporter {
    fn name(&self) -> &str {
        "material"
    }

    fn can_import(&self, key: &str) -> bool {
        key.starts_with(Self::PREFIX)
    }

    fn load(&mut self, key: &str, host: &mut dyn ObjectHost) -> Result<ObjectHandle, ImportError> {
        let name = key
            .strip_prefix(Self::PREFIX)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ImportError::Failed {
                importer: self.name().to_string(),
                key: key.to_string(),
                message: "empty material name".to_string(),
            })?;
        let handle = construct_as::<Material>(host, MATERIAL_TYPE)?;
        if let Some(material) = host.object_mut(handle).and_then(downcast_mut::<Material>) {
            *material = Material::named(name);
        }
        self.loaded += 1;
        Ok(handle)
    }
}

/// Registers the scene types with a world and a codec registry.
pub fn register_scene_types(world: &mut World, codecs: &mut CodecRegistry) -> GraphResult<()> {
    world.register::<SceneNode>();
    world.register::<Material>();
    codecs.register(SceneNodeCodec::new()?)?;
    codecs.register(MaterialCodec::new()?)?;
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn construct_as<T: LiveObject>(
    host: &mut dyn ObjectHost,
    type_name: &str,
) -> Result<ObjectHandle, ImportError> {
    let descriptor = TypeDescriptor::builder(type_name)
        .build()
        .map_err(|err| ImportError::Failed {
            importer: "material".to_string(),
            key: type_name.to_string(),
            message: err.to_string(),
        })?;
    let handle = host.construct(&descriptor)?;
    let matches = host
        .object(handle)
        .and_then(downcast_ref::<T>)
        .is_some();
    if !matches {
        host.destroy(handle);
        return Err(crate::host::HostError::Refused(format!(
            "host built the wrong type for '{type_name}'"
        ))
        .into());
    }
    Ok(handle)
}

fn typed<'o, T: LiveObject>(
    object: &'o dyn LiveObject,
    expected: &str,
) -> Result<&'o T, CodecError> {
    downcast_ref::<T>(object).ok_or_else(|| CodecError::WrongType {
        expected: expected.to_string(),
        found: object.type_name().to_string(),
    })
}

fn typed_mut<'o, T: LiveObject>(
    object: &'o mut dyn LiveObject,
    expected: &str,
) -> Result<&'o mut T, CodecError> {
    let found = object.type_name();
    downcast_mut::<T>(object).ok_or_else(|| CodecError::WrongType {
        expected: expected.to_string(),
        found: found.to_string(),
    })
}

fn unknown(type_name: &str, field: FieldIndex) -> CodecError {
    CodecError::UnknownField {
        type_name: type_name.to_string(),
        field,
    }
}

fn mismatch(descriptor: &TypeDescriptor, field: FieldIndex, slot: &Slot) -> CodecError {
    match descriptor.field(field) {
        Some(declared) => CodecError::KindMismatch {
            field,
            expected: declared.kind,
            found: slot.kind(),
        },
        None => unknown(descriptor.name(), field),
    }
}

fn text(field: FieldIndex, value: Value) -> Result<String, CodecError> {
    match value {
        Value::Text(text) => Ok(text),
        _ => Err(CodecError::invalid(field, "expected text")),
    }
}

fn texts(field: FieldIndex, value: Value) -> Result<Vec<String>, CodecError> {
    match value {
        Value::List(items) => items.into_iter().map(|item| text(field, item)).collect(),
        _ => Err(CodecError::invalid(field, "expected a list of text")),
    }
}

fn vector<const N: usize>(field: FieldIndex, value: Value) -> Result<[f64; N], CodecError> {
    let items = value
        .as_list()
        .filter(|items| items.len() == N)
        .ok_or_else(|| CodecError::invalid(field, format!("expected {N} numbers")))?;
    let mut output = [0.0; N];
    for (slot, item) in output.iter_mut().zip(items) {
        *slot = item
            .as_float()
            .ok_or_else(|| CodecError::invalid(field, "expected a number"))?;
    }
    Ok(output)
}

#[cfg(test)]
#[path = "tests/scene_tests.rs"]
mod tests;
