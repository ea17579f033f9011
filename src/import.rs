//! External importers.
//!
//! Imported objects are read-only graph leaves: they are named by
//! [`ObjectId::from_import_key`], bound persistently, never walked into and
//! never stored as records.

use std::collections::BTreeMap;
use std::fmt;

use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::GraphResult;
use crate::host::{HostError, ObjectHandle, ObjectHost};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;

#[derive(Debug, Error, Diagnostic)]
pub enum ImportError {
    #[error("no importer accepts '{0}'")]
    #[diagnostic(code("import.no_importer"), help("register an importer for this key"))]
    NoImporter(String),
    #[error("importer '{importer}' failed on '{key}': {message}")]
    #[diagnostic(code("import.failed"))]
    Failed {
        importer: String,
        key: String,
        message: String,
    },
    #[error(transparent)]
    #[diagnostic(transparent)]
    Host(#[from] HostError),
}

/// Loads objects from an external format.
pub trait Importer {
    fn name(&self) -> &str;

    fn can_import(&self, key: &str) -> bool;

    /// Materializes the object named by `key` in the host.
    fn load(&mut self, key: &str, host: &mut dyn ObjectHost) -> Result<ObjectHandle, ImportError>;

    /// Releases an object previously returned by [`load`](Self::load).
    fn release(&mut self, handle: ObjectHandle, host: &mut dyn ObjectHost) {
        host.destroy(handle);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportedObject {
    pub key: String,
    pub handle: ObjectHandle,
    importer: usize,
}

/// Registered importers plus the objects they currently hold.
#[derive(Default)]
pub struct Imports {
    importers: Vec<Box<dyn Importer>>,
    loaded: BTreeMap<ObjectId, ImportedObject>,
}

impl fmt::Debug for Imports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Imports")
            .field(
                "importers",
                &self.importers.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I: Importer + 'static>(&mut self, importer: I) {
        self.importers.push(Box::new(importer));
    }

    /// Imports `key`, or returns the already imported object.
    pub fn import(
        &mut self,
        key: &str,
        host: &mut dyn ObjectHost,
        identity: &mut IdentityRegistry,
    ) -> GraphResult<(ObjectId, ObjectHandle)> {
        let id = ObjectId::from_import_key(key);
        if let Some(existing) = self.loaded.get(&id) {
            if host.contains(existing.handle) {
                return Ok((id, existing.handle));
            }
            self.loaded.remove(&id);
            identity.unbind_id(id);
        }
        let index = self
            .importers
            .iter()
            .position(|importer| importer.can_import(key))
            .ok_or_else(|| ImportError::NoImporter(key.to_string()))?;
        let importer = &mut self.importers[index];
        let handle = importer.load(key, host)?;
        if let Err(err) = identity.bind(id, handle) {
            importer.release(handle, host);
            return Err(err);
        }
        info!(%id, key, importer = importer.name(), "imported external object");
        self.loaded.insert(
            id,
            ImportedObject {
                key: key.to_string(),
                handle,
                importer: index,
            },
        );
        Ok((id, handle))
    }

    pub fn is_imported(&self, id: ObjectId) -> bool {
        self.loaded.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&ImportedObject> {
        self.loaded.get(&id)
    }

    pub fn imported_handle(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.loaded
            .iter()
            .find(|(_, object)| object.handle == handle)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn release(
        &mut self,
        id: ObjectId,
        host: &mut dyn ObjectHost,
        identity: &mut IdentityRegistry,
    ) -> bool {
        let Some(object) = self.loaded.remove(&id) else {
            return false;
        };
        identity.unbind_id(id);
        if let Some(importer) = self.importers.get_mut(object.importer) {
            importer.release(object.handle, host);
        }
        debug!(%id, key = %object.key, "released imported object");
        true
    }
}
