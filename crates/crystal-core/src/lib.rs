//! CrystalStore Core - the persistence engine
//!
//! This crate implements the engine proper:
//! - Check registry: startup-time side-file tracking known
//!   (type, location) pairs and per-plane journal replay cursors
//! - Crystal: per-type lifecycle controller (prepare/load/save/delete,
//!   save policies, history rotation)
//! - Flakes: containers owning memory-resident fragments
//! - Himo cache: process-wide, memory-bounded cache of loaded fragments
//!   with write-back eviction

pub mod check;
pub mod crystal;
pub mod flake;
pub mod himo;
pub mod serialize;

pub use check::{CheckRegistry, DataLocationId};
pub use crystal::{Crystal, CrystalStartResult};
pub use flake::{Flake, FlakeId, FragmentId};
pub use himo::{HimoCache, HimoKey, HimoOwner, DEFAULT_MARGIN};
pub use serialize::{deserialize_object, reconstruct_default, serialize_object, CrystalObject};
