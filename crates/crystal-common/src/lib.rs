//! CrystalStore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, the location and configuration
//! model, and the pooled buffer allocator used across all CrystalStore
//! components.

pub mod config;
pub mod error;
pub mod location;
pub mod pool;

pub use config::{CrystalConfig, FilerConfig, SaveFormat, SavePolicy, StorageConfig, StorageId};
pub use error::{Error, Result};
pub use location::{DirectoryLocation, FileLocation};
pub use pool::{BytePool, PoolStats, PooledBuffer};
