//! Blob storage collaborator and the binary envelope for data blobs.
//!
//! The project core treats storage as an opaque key-value interface keyed by
//! `(ObjectId, StreamKind)`. Two stores are bundled: [`MemoryStore`] for
//! tests and embedding, and [`DirectoryStore`] for on-disk projects.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::ObjectId;
use crate::version::{DATA_BINARY_MAGIC, DATA_FORMAT_VERSION};

/// Which of an asset's independently readable blobs is addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Metadata,
    Data,
    Thumbnail,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Metadata, StreamKind::Data, StreamKind::Thumbnail];

    fn directory(self) -> &'static str {
        match self {
            StreamKind::Metadata => "meta",
            StreamKind::Data => "data",
            StreamKind::Thumbnail => "thumb",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            StreamKind::Metadata => "json",
            StreamKind::Data => "agd",
            StreamKind::Thumbnail => "thumb",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Metadata => "metadata",
            StreamKind::Data => "data",
            StreamKind::Thumbnail => "thumbnail",
        })
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    #[diagnostic(code("storage.io"))]
    Io(#[from] std::io::Error),
    #[error("no {kind} blob for {id}")]
    #[diagnostic(code("storage.not_found"))]
    NotFound { id: ObjectId, kind: StreamKind },
    #[error("ephemeral id {0} cannot be stored")]
    #[diagnostic(code("storage.ephemeral_id"))]
    EphemeralId(ObjectId),
    #[error("data blob too small")]
    #[diagnostic(code("storage.too_small"))]
    TooSmall,
    #[error("data blob too large")]
    #[diagnostic(code("storage.too_large"))]
    TooLarge,
    #[error("invalid data blob magic bytes")]
    #[diagnostic(code("storage.invalid_magic"))]
    InvalidMagic,
    #[error("incompatible data format version: found {found}, expected {expected}")]
    #[diagnostic(code("storage.incompatible_version"))]
    IncompatibleVersion { found: u16, expected: u16 },
    #[error("data blob checksum mismatch")]
    #[diagnostic(code("storage.checksum"))]
    ChecksumMismatch,
    #[error("data blob length mismatch")]
    #[diagnostic(code("storage.length"))]
    LengthMismatch,
    #[error("serialization error: {0}")]
    #[diagnostic(code("storage.serialization"))]
    Serialization(String),
    #[error("recovery failed (primary: {primary}, backup: {})", .backup.as_ref().map_or_else(|| "missing".to_string(), ToString::to_string))]
    #[diagnostic(code("storage.recovery_failed"))]
    RecoveryFailed {
        primary: Box<StorageError>,
        backup: Option<Box<StorageError>>,
    },
}

// =============================================================================
// Envelope
// =============================================================================

const HEADER_LEN: usize = 4 + 2 + 4 + 4;

/// Wraps a postcard payload: `magic | version u16 | crc32 u32 | len u32 | payload`.
pub fn encode_envelope<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let payload =
        postcard::to_allocvec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let checksum = crc32fast::hash(&payload);
    let payload_len = u32::try_from(payload.len()).map_err(|_| StorageError::TooLarge)?;

    let mut output = Vec::with_capacity(HEADER_LEN + payload.len());
    output.extend_from_slice(&DATA_BINARY_MAGIC);
    output.extend_from_slice(&DATA_FORMAT_VERSION.to_le_bytes());
    output.extend_from_slice(&checksum.to_le_bytes());
    output.extend_from_slice(&payload_len.to_le_bytes());
    output.extend_from_slice(&payload);
    Ok(output)
}

/// Validates magic, version, length and checksum, then decodes the payload.
pub fn decode_envelope<T: DeserializeOwned>(input: &[u8]) -> Result<T, StorageError> {
    if input.len() < HEADER_LEN {
        return Err(StorageError::TooSmall);
    }
    if input[0..4] != DATA_BINARY_MAGIC {
        return Err(StorageError::InvalidMagic);
    }
    let version = u16::from_le_bytes([input[4], input[5]]);
    if version != DATA_FORMAT_VERSION {
        return Err(StorageError::IncompatibleVersion {
            found: version,
            expected: DATA_FORMAT_VERSION,
        });
    }
    let checksum = u32::from_le_bytes([input[6], input[7], input[8], input[9]]);
    let payload_len = u32::from_le_bytes([input[10], input[11], input[12], input[13]]) as usize;
    let payload = &input[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(StorageError::LengthMismatch);
    }
    if crc32fast::hash(payload) != checksum {
        return Err(StorageError::ChecksumMismatch);
    }
    postcard::from_bytes(payload).map_err(|e| StorageError::Serialization(e.to_string()))
}

// =============================================================================
// BlobStore
// =============================================================================

/// Byte-level persistence keyed by `(id, kind)`.
pub trait BlobStore {
    fn read(&self, id: ObjectId, kind: StreamKind) -> Result<Vec<u8>, StorageError>;

    fn write(&mut self, id: ObjectId, kind: StreamKind, bytes: &[u8]) -> Result<(), StorageError>;

    /// Removes a blob. Missing blobs are not an error.
    fn remove(&mut self, id: ObjectId, kind: StreamKind) -> Result<(), StorageError>;

    /// Ids with a blob of `kind`, sorted.
    fn list(&self, kind: StreamKind) -> Result<Vec<ObjectId>, StorageError>;

    fn exists(&self, id: ObjectId, kind: StreamKind) -> bool {
        self.read(id, kind).is_ok()
    }

    /// Previous version of a blob, for stores that keep one.
    fn read_backup(&self, _id: ObjectId, _kind: StreamKind) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }
}

/// Reads and decodes a data blob, falling back to the backup copy when the
/// primary blob is corrupt.
pub fn read_with_recovery<T: DeserializeOwned>(
    store: &dyn BlobStore,
    id: ObjectId,
    kind: StreamKind,
) -> Result<T, StorageError> {
    let primary = store.read(id, kind)?;
    match decode_envelope(&primary) {
        Ok(value) => Ok(value),
        Err(primary_err) => match store.read_backup(id, kind)? {
            Some(backup) => decode_envelope(&backup).map_err(|backup_err| {
                StorageError::RecoveryFailed {
                    primary: Box::new(primary_err),
                    backup: Some(Box::new(backup_err)),
                }
            }),
            None => Err(StorageError::RecoveryFailed {
                primary: Box::new(primary_err),
                backup: None,
            }),
        },
    }
}

fn check_persistent(id: ObjectId) -> Result<(), StorageError> {
    if id.is_ephemeral() {
        return Err(StorageError::EphemeralId(id));
    }
    Ok(())
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    blobs: BTreeMap<(ObjectId, StreamKind), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryStore {
    fn read(&self, id: ObjectId, kind: StreamKind) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .get(&(id, kind))
            .cloned()
            .ok_or(StorageError::NotFound { id, kind })
    }

    fn write(&mut self, id: ObjectId, kind: StreamKind, bytes: &[u8]) -> Result<(), StorageError> {
        check_persistent(id)?;
        self.blobs.insert((id, kind), bytes.to_vec());
        Ok(())
    }

    fn remove(&mut self, id: ObjectId, kind: StreamKind) -> Result<(), StorageError> {
        self.blobs.remove(&(id, kind));
        Ok(())
    }

    fn list(&self, kind: StreamKind) -> Result<Vec<ObjectId>, StorageError> {
        Ok(self
            .blobs
            .keys()
            .filter(|(_, blob_kind)| *blob_kind == kind)
            .map(|(id, _)| *id)
            .collect())
    }

    fn exists(&self, id: ObjectId, kind: StreamKind) -> bool {
        self.blobs.contains_key(&(id, kind))
    }
}

// =============================================================================
// DirectoryStore
// =============================================================================

/// On-disk store: `meta/<id>.json`, `data/<id>.agd`, `thumb/<id>.thumb`.
///
/// Writes go through a temporary file and a rename; with backups enabled the
/// previous blob is kept next to it as `<file>.bak`.
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    keep_backups: bool,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_backups: true,
        }
    }

    pub fn with_backups(mut self, keep_backups: bool) -> Self {
        self.keep_backups = keep_backups;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_layout(&self) -> Result<(), StorageError> {
        for kind in StreamKind::ALL {
            fs::create_dir_all(self.root.join(kind.directory()))?;
        }
        Ok(())
    }

    pub fn blob_path(&self, id: ObjectId, kind: StreamKind) -> PathBuf {
        self.root
            .join(kind.directory())
            .join(format!("{id}.{}", kind.extension()))
    }

    /// True when `path` names a blob of this store.
    pub fn is_blob_path(&self, path: &Path) -> bool {
        StreamKind::ALL.iter().any(|kind| {
            path.parent() == Some(self.root.join(kind.directory()).as_path())
                && path.extension().and_then(|ext| ext.to_str()) == Some(kind.extension())
                && path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem.parse::<ObjectId>().is_ok())
        })
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "target path has no parent",
            ))
        })?;
        fs::create_dir_all(parent)?;
        if self.keep_backups && path.exists() {
            fs::copy(path, backup_path(path))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl BlobStore for DirectoryStore {
    fn read(&self, id: ObjectId, kind: StreamKind) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.blob_path(id, kind)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { id, kind })
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn write(&mut self, id: ObjectId, kind: StreamKind, bytes: &[u8]) -> Result<(), StorageError> {
        check_persistent(id)?;
        self.atomic_write(&self.blob_path(id, kind), bytes)
    }

    fn remove(&mut self, id: ObjectId, kind: StreamKind) -> Result<(), StorageError> {
        let path = self.blob_path(id, kind);
        for candidate in [backup_path(&path), path] {
            match fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(())
    }

    fn list(&self, kind: StreamKind) -> Result<Vec<ObjectId>, StorageError> {
        let dir = self.root.join(kind.directory());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(kind.extension()) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<ObjectId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn exists(&self, id: ObjectId, kind: StreamKind) -> bool {
        self.blob_path(id, kind).exists()
    }

    fn read_backup(&self, id: ObjectId, kind: StreamKind) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(backup_path(&self.blob_path(id, kind))) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut output = path.as_os_str().to_os_string();
    output.push(".bak");
    PathBuf::from(output)
}

#[cfg(test)]
#[path = "tests/storage_tests.rs"]
mod tests;
