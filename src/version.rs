//! Format versioning constants for persisted project blobs.
//!
//! Every blob kind written by the storage layer carries an explicit version,
//! enabling compatibility checks and clear upgrade paths.

/// Current binary format version for asset data blobs.
/// Increment when the layout of `AssetData` changes.
pub const DATA_FORMAT_VERSION: u16 = 1;

/// Current format version for asset metadata documents.
pub const METADATA_FORMAT_VERSION: u16 = 1;

/// Magic bytes for asset data blobs.
pub const DATA_BINARY_MAGIC: [u8; 4] = *b"AGRD";
