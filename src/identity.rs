//! Identity registry: the bidirectional map between live objects and ids.
//!
//! # Contracts
//! - **Invariant**: `id -> handle` and `handle -> id` are both functions and
//!   are inverse to each other for every registered pair.
//! - **Postcondition**: `get_or_create_id` is idempotent per handle.

use std::collections::HashMap;

use crate::error::{GraphError, GraphResult};
use crate::host::ObjectHandle;
use crate::id::{IdAllocator, ObjectId};

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_handle: HashMap<ObjectHandle, ObjectId>,
    by_id: HashMap<ObjectId, ObjectHandle>,
    allocator: IdAllocator,
    next_ephemeral: u64,
}

impl IdentityRegistry {
    pub fn new(allocator: IdAllocator) -> Self {
        Self {
            allocator,
            ..Self::default()
        }
    }

    /// Draws a fresh persistent id without binding it.
    pub fn allocate(&mut self) -> ObjectId {
        loop {
            let id = self.allocator.next_persistent();
            if !self.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Returns the id of `handle`, registering a fresh persistent id on first use.
    pub fn get_or_create_id(&mut self, handle: ObjectHandle) -> ObjectId {
        if let Some(id) = self.by_handle.get(&handle) {
            return *id;
        }
        let id = self.allocate();
        self.insert(id, handle);
        id
    }

    /// Returns the id of `handle`, registering a process-local id on first use.
    pub fn assign_ephemeral(&mut self, handle: ObjectHandle) -> ObjectId {
        if let Some(id) = self.by_handle.get(&handle) {
            return *id;
        }
        self.next_ephemeral += 1;
        let id = ObjectId::Ephemeral(self.next_ephemeral);
        self.insert(id, handle);
        id
    }

    /// Binds a known id to a handle.
    ///
    /// Re-binding the same pair is a no-op. Binding an id that already names
    /// another object, or a handle that already has another id, is refused.
    pub fn bind(&mut self, id: ObjectId, handle: ObjectHandle) -> GraphResult<()> {
        if let Some(existing) = self.by_id.get(&id) {
            if *existing == handle {
                return Ok(());
            }
            return Err(GraphError::IdentityCollision {
                id,
                existing: *existing,
                incoming: handle,
            });
        }
        if let Some(existing) = self.by_handle.get(&handle) {
            return Err(GraphError::IdentityRebind {
                handle,
                existing: *existing,
                incoming: id,
            });
        }
        self.insert(id, handle);
        Ok(())
    }

    #[inline]
    pub fn id_of(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.by_handle.get(&handle).copied()
    }

    #[inline]
    pub fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.by_id.get(&id).copied()
    }

    pub fn contains_id(&self, id: ObjectId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn unbind(&mut self, handle: ObjectHandle) -> Option<ObjectId> {
        let id = self.by_handle.remove(&handle)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn unbind_id(&mut self, id: ObjectId) -> Option<ObjectHandle> {
        let handle = self.by_id.remove(&id)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Registered pairs in id order.
    pub fn entries(&self) -> Vec<(ObjectId, ObjectHandle)> {
        let mut entries: Vec<_> = self.by_id.iter().map(|(id, handle)| (*id, *handle)).collect();
        entries.sort_unstable();
        entries
    }

    fn insert(&mut self, id: ObjectId, handle: ObjectHandle) {
        self.by_id.insert(id, handle);
        self.by_handle.insert(handle, id);
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
