//! Configuration types for CrystalStore
//!
//! This module defines the per-type crystal configuration, the
//! backend-tagged filer configuration, and the capacity-bounded named
//! storage registry consumed from the host application.

use crate::error::{Error, Result};
use crate::location::{DirectoryLocation, FileLocation};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Physical target of raw byte operations
///
/// Distinct from [`FileLocation`], which names where a root descriptor
/// lives: a `FilerConfig` describes the resource a filer is bound to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilerConfig {
    /// No backing store configured
    #[default]
    Empty,
    /// A file inside a local directory
    Local {
        directory: String,
        file: String,
        /// Upper bound on parallel blocking I/O tasks (None = unbounded)
        max_parallel: Option<usize>,
    },
    /// An object inside a bucket
    ObjectStore {
        bucket: String,
        directory: String,
        file: String,
    },
}

impl FilerConfig {
    /// Create a local filer configuration
    pub fn local(directory: impl Into<String>, file: impl Into<String>) -> Self {
        Self::Local {
            directory: directory.into(),
            file: file.into(),
            max_parallel: None,
        }
    }

    /// Create an object-store filer configuration
    pub fn object_store(
        bucket: impl Into<String>,
        directory: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        Self::ObjectStore {
            bucket: bucket.into(),
            directory: directory.into(),
            file: file.into(),
        }
    }

    /// Check whether this is the empty configuration
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The logical filename within the backend namespace
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Local { file, .. } | Self::ObjectStore { file, .. } => Some(file),
        }
    }

    /// The directory portion as a composable location
    #[must_use]
    pub fn directory_location(&self) -> DirectoryLocation {
        match self {
            Self::Empty => DirectoryLocation::Empty,
            Self::Local { directory, .. } => DirectoryLocation::local(directory.clone()),
            Self::ObjectStore {
                bucket, directory, ..
            } => DirectoryLocation::object_store(bucket.clone(), directory.clone()),
        }
    }

    /// The full file location this configuration resolves to
    #[must_use]
    pub fn file_location(&self) -> FileLocation {
        match self.file_name() {
            Some(file) => self.directory_location().combine(file),
            None => FileLocation::Empty,
        }
    }

    /// A sibling configuration pointing at history slot `index`
    ///
    /// History files share the namespace of the main file with a numeric
    /// suffix: `counter.bin` rotates into `counter.bin.1`, `.2`, ...
    /// `.1` is always the newest history file.
    #[must_use]
    pub fn history_config(&self, index: u32) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Local {
                directory,
                file,
                max_parallel,
            } => Self::Local {
                directory: directory.clone(),
                file: format!("{file}.{index}"),
                max_parallel: *max_parallel,
            },
            Self::ObjectStore {
                bucket,
                directory,
                file,
            } => Self::ObjectStore {
                bucket: bucket.clone(),
                directory: directory.clone(),
                file: format!("{file}.{index}"),
            },
        }
    }
}

/// When a crystal persists its root object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavePolicy {
    /// Saving disabled; explicit save calls are no-ops
    None,
    /// Save only when explicitly requested
    #[default]
    Manual,
    /// Save on request and additionally every `save_interval`
    Periodic,
    /// Save synchronously after every mutation notification
    Instant,
}

/// On-disk encoding of a crystal's root object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveFormat {
    /// Compact fixed-point binary
    #[default]
    Binary,
    /// UTF-8 text
    Utf8,
}

/// Per-registered-type crystal configuration (immutable once applied)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrystalConfig {
    /// Save policy for the root object
    pub save_policy: SavePolicy,
    /// Interval between automatic saves (Periodic policy only)
    pub save_interval: Duration,
    /// Serialization format for the root object
    pub save_format: SaveFormat,
    /// Where the root descriptor is stored
    pub file_config: FilerConfig,
    /// Number of rotated history files kept alongside the main file
    pub file_history_count: u32,
    /// Escalate load failure to a fatal startup condition
    pub required_for_loading: bool,
    /// Optional bulk-payload storage registry
    pub storage_config: Option<StorageConfig>,
}

impl Default for CrystalConfig {
    fn default() -> Self {
        Self {
            save_policy: SavePolicy::Manual,
            save_interval: Duration::from_secs(60),
            save_format: SaveFormat::Binary,
            file_config: FilerConfig::Empty,
            file_history_count: 0,
            required_for_loading: false,
            storage_config: None,
        }
    }
}

impl CrystalConfig {
    /// Validate internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.save_policy == SavePolicy::Periodic && self.save_interval.is_zero() {
            return Err(Error::invalid_configuration(
                "periodic save policy requires a non-zero interval",
            ));
        }
        if self.save_policy != SavePolicy::None && self.file_config.is_empty() {
            return Err(Error::invalid_configuration(
                "save policy requires a file configuration",
            ));
        }
        Ok(())
    }
}

/// Identifier of a capacity-bounded named storage
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StorageId(pub u16);

/// One capacity-bounded named storage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Directory holding the storage's payload bodies
    pub directory: DirectoryLocation,
    /// Capacity bound in bytes
    pub capacity: u64,
}

/// Registry of capacity-bounded named storages for large payload bodies
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    storages: BTreeMap<StorageId, StorageEntry>,
    next_id: u16,
}

impl StorageConfig {
    /// Create an empty storage registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a storage and return its id
    ///
    /// Rejects a directory that is already registered. Ids are probed
    /// past any still-registered id after the counter wraps, so an
    /// existing storage is never silently replaced.
    pub fn add_storage(&mut self, directory: DirectoryLocation, capacity: u64) -> Result<StorageId> {
        if self.storages.values().any(|s| s.directory == directory) {
            return Err(Error::AlreadyExists(format!(
                "storage directory {directory:?} already registered"
            )));
        }
        if self.storages.len() > usize::from(u16::MAX) {
            return Err(Error::invalid_configuration(
                "storage registry has no free id",
            ));
        }
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let id = StorageId(self.next_id);
            if !self.storages.contains_key(&id) {
                self.storages.insert(id, StorageEntry { directory, capacity });
                return Ok(id);
            }
        }
    }

    #[cfg(test)]
    fn set_next_id(&mut self, next_id: u16) {
        self.next_id = next_id;
    }

    /// Remove a storage; returns true if it existed
    pub fn delete_storage(&mut self, id: StorageId) -> bool {
        self.storages.remove(&id).is_some()
    }

    /// Look up a storage by id
    #[must_use]
    pub fn get(&self, id: StorageId) -> Option<&StorageEntry> {
        self.storages.get(&id)
    }

    /// Iterate over registered storages
    pub fn iter(&self) -> impl Iterator<Item = (StorageId, &StorageEntry)> {
        self.storages.iter().map(|(id, entry)| (*id, entry))
    }

    /// Number of registered storages
    #[must_use]
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    /// Check if no storage is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}
