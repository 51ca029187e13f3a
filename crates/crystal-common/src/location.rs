//! Location model
//!
//! Immutable, backend-tagged descriptors naming where a root descriptor
//! lives. Each backend tag comes in two flavors: a composable directory
//! location and a terminal file location. `combine` never changes the
//! backend tag, and persisted configuration embeds these types, so the
//! serde variant order must stay stable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A composable directory location
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectoryLocation {
    /// No location configured
    #[default]
    Empty,
    /// A directory on the local filesystem
    Local { path: String },
    /// A key prefix inside an object-storage bucket
    ObjectStore { bucket: String, path: String },
}

/// A terminal file location
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileLocation {
    /// No location configured
    #[default]
    Empty,
    /// A file on the local filesystem
    Local { path: String },
    /// A key inside an object-storage bucket
    ObjectStore { bucket: String, path: String },
}

impl DirectoryLocation {
    /// Create a local directory location
    pub fn local(path: impl Into<String>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Create an object-store directory location
    pub fn object_store(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self::ObjectStore {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Combine this directory with a filename, producing a file location
    /// of the same backend.
    ///
    /// Exactly one separator ends up between the directory path and the
    /// filename regardless of the trailing-slash state of the input. For
    /// an object store, an empty prefix means the filename is the whole
    /// key. Combining `Empty` yields `FileLocation::Empty`.
    #[must_use]
    pub fn combine(&self, filename: &str) -> FileLocation {
        match self {
            Self::Empty => FileLocation::Empty,
            Self::Local { path } => FileLocation::Local {
                path: join_path(path, filename),
            },
            Self::ObjectStore { bucket, path } => FileLocation::ObjectStore {
                bucket: bucket.clone(),
                path: join_path(path, filename),
            },
        }
    }

    /// Check whether this is the empty location
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl FileLocation {
    /// Create a local file location
    pub fn local(path: impl Into<String>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Create an object-store file location
    pub fn object_store(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self::ObjectStore {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Check whether this is the empty location
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "(empty)"),
            Self::Local { path } => write!(f, "{path}"),
            Self::ObjectStore { bucket, path } => write!(f, "{bucket}/{path}"),
        }
    }
}

/// Join a directory path and a filename with exactly one `/` separator.
///
/// An empty directory path means the filename is the whole path.
fn join_path(dir: &str, filename: &str) -> String {
    if dir.is_empty() {
        filename.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{filename}")
    } else {
        format!("{dir}/{filename}")
    }
}
