//! Host object system.
//!
//! The graph codec never allocates live objects itself: construction,
//! destruction and child enumeration are capabilities of an [`ObjectHost`].
//! [`World`] is the bundled host, a generational slab of boxed
//! [`LiveObject`]s with a factory table keyed by type name.
//!
//! # Contracts
//! - **Invariant**: a handle is never reused for a different object; a
//!   destroyed slot bumps its generation so stale handles resolve to `None`.
//! - **Postcondition**: `World::children` is deterministic (the object's own
//!   declared child order).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

use crate::codec::TypeDescriptor;

// =============================================================================
// ObjectHandle
// =============================================================================

/// Process-local handle of a live object owned by a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

impl ObjectHandle {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

// =============================================================================
// LiveObject
// =============================================================================

/// A strongly typed object living inside a host.
///
/// Implementors usually forward the two `Any` accessors with
/// [`live_object_any!`](crate::live_object_any).
pub trait LiveObject: Any + fmt::Debug {
    /// Registered type name; selects the codec and the host factory.
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Display name used for path addressing.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Current children, in declaration order.
    fn children(&self) -> Vec<ObjectHandle> {
        Vec::new()
    }
}

/// Implements the `Any` accessors of [`LiveObject`].
#[macro_export]
macro_rules! live_object_any {
    () => {
        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
            self
        }
    };
}

/// Borrows a live object as its concrete type.
pub fn downcast_ref<T: LiveObject>(object: &dyn LiveObject) -> Option<&T> {
    object.as_any().downcast_ref::<T>()
}

pub fn downcast_mut<T: LiveObject>(object: &mut dyn LiveObject) -> Option<&mut T> {
    object.as_any_mut().downcast_mut::<T>()
}

// =============================================================================
// ObjectHost
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum HostError {
    #[error("host cannot construct objects of type '{0}'")]
    #[diagnostic(code("host.unknown_type"))]
    UnknownType(String),
    #[error("object {0} does not exist")]
    #[diagnostic(code("host.stale_handle"))]
    StaleHandle(ObjectHandle),
    #[error("host refused the operation: {0}")]
    #[diagnostic(code("host.refused"))]
    Refused(String),
}

/// Capabilities the graph codec consumes from the host object system.
pub trait ObjectHost {
    /// Allocates a default-initialized object of the described type.
    fn construct(&mut self, descriptor: &TypeDescriptor) -> Result<ObjectHandle, HostError>;

    /// Destroys an object. Returns false for stale handles.
    fn destroy(&mut self, handle: ObjectHandle) -> bool;

    fn object(&self, handle: ObjectHandle) -> Option<&dyn LiveObject>;

    fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut dyn LiveObject>;

    /// Children of an object, used for path-based addressing.
    fn children(&self, handle: ObjectHandle) -> Vec<ObjectHandle>;

    fn contains(&self, handle: ObjectHandle) -> bool {
        self.object(handle).is_some()
    }
}

/// Resolves a `/`-separated name path below `root`.
///
/// The empty path resolves to `root` itself. At each level the first child
/// whose [`LiveObject::name`] matches wins.
pub fn find_by_path(host: &dyn ObjectHost, root: ObjectHandle, path: &str) -> Option<ObjectHandle> {
    let mut current = root;
    host.object(current)?;
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        current = host.children(current).into_iter().find(|child| {
            host.object(*child)
                .and_then(|object| object.name())
                .is_some_and(|name| name == segment)
        })?;
    }
    Some(current)
}

// =============================================================================
// World
// =============================================================================

type Factory = fn() -> Box<dyn LiveObject>;

#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<Box<dyn LiveObject>>,
}

/// Bundled [`ObjectHost`]: a generational slab of boxed objects.
#[derive(Default)]
pub struct World {
    slots: Vec<Slot>,
    free: Vec<u32>,
    factories: HashMap<&'static str, Factory>,
    live: usize,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .field("types", &self.factories.len())
            .finish()
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory so the type can be constructed during decode.
    pub fn register<T: LiveObject + Default>(&mut self) {
        fn make<T: LiveObject + Default>() -> Box<dyn LiveObject> {
            Box::new(T::default())
        }
        let name = T::default().type_name();
        self.factories.insert(name, make::<T>);
    }

    pub fn has_factory(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Inserts an already-built object.
    pub fn spawn<T: LiveObject>(&mut self, object: T) -> ObjectHandle {
        self.insert(Box::new(object))
    }

    pub fn get<T: LiveObject>(&self, handle: ObjectHandle) -> Option<&T> {
        downcast_ref::<T>(self.object(handle)?)
    }

    pub fn get_mut<T: LiveObject>(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        downcast_mut::<T>(self.object_mut(handle)?)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live handles in slot order.
    pub fn handles(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.object
                .as_ref()
                .map(|_| ObjectHandle::new(index as u32, slot.generation))
        })
    }

    fn insert(&mut self, object: Box<dyn LiveObject>) -> ObjectHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            return ObjectHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        ObjectHandle::new(index, 0)
    }

    fn slot(&self, handle: ObjectHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
    }
}

impl ObjectHost for World {
    fn construct(&mut self, descriptor: &TypeDescriptor) -> Result<ObjectHandle, HostError> {
        let factory = self
            .factories
            .get(descriptor.name())
            .ok_or_else(|| HostError::UnknownType(descriptor.name().to_string()))?;
        let object = factory();
        Ok(self.insert(object))
    }

    fn destroy(&mut self, handle: ObjectHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index() as usize) else {
            return false;
        };
        if slot.generation != handle.generation() || slot.object.is_none() {
            return false;
        }
        slot.object = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.live -= 1;
        true
    }

    fn object(&self, handle: ObjectHandle) -> Option<&dyn LiveObject> {
        let object: &dyn LiveObject = self.slot(handle)?.object.as_deref()?;
        Some(object)
    }

    fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut dyn LiveObject> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())?;
        let object: &mut dyn LiveObject = slot.object.as_deref_mut()?;
        Some(object)
    }

    fn children(&self, handle: ObjectHandle) -> Vec<ObjectHandle> {
        self.object(handle)
            .map(|object| object.children())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "tests/host_tests.rs"]
mod tests;
