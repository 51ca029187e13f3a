//! CrystalStore Filer - backend-agnostic raw byte I/O
//!
//! This crate translates logical (offset, length) read/write/delete
//! requests into backend-specific calls:
//! - Local filesystem (positioned reads/writes on a named path)
//! - Object storage (bucket + key, offset writes emulated by
//!   read-modify-write)
//!
//! All operations are asynchronous with explicit wait bounds; a timeout
//! of `None` means "apply the backend's own default bound", never "wait
//! forever".

pub mod filer;
pub mod local;
pub mod object;
pub mod raw;

pub use filer::{resolve_filer, Filer};
pub use local::{LocalFiler, LOCAL_DEFAULT_TIMEOUT};
pub use object::{MemoryObjectStore, ObjectFiler, ObjectStore, OBJECT_DEFAULT_TIMEOUT};
pub use raw::{LocalRawFiler, ObjectRawFiler, RawFiler, RawFilerToFiler};
