//! Check registry
//!
//! A small durable side-file recording which (type, location) pairs are
//! already known and the last-replayed journal position per logical
//! partition ("plane"). The registry is an advisory bootstrap cache,
//! never the system of record: losing it costs a full reload/replay and
//! nothing else, so every load/save failure is logged and swallowed.
//!
//! Side-file format:
//! ```text
//! +--------+---------+--------------+--------+
//! | Magic  | Version | bincode body | CRC32C |
//! | 4B     | 1B      | var          | 4B     |
//! +--------+---------+--------------+--------+
//! ```

use crystal_common::FileLocation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Side-file magic number ("CKRG")
const CHECK_MAGIC: u32 = 0x434B_5247;

/// Side-file format version
const CHECK_VERSION: u8 = 1;

/// Identity of one (type, location) pairing
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataLocationId {
    pub type_name: String,
    pub location: FileLocation,
}

impl DataLocationId {
    /// Create an identity for a type name and file location
    pub fn new(type_name: impl Into<String>, location: FileLocation) -> Self {
        Self {
            type_name: type_name.into(),
            location,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryState {
    known: HashSet<DataLocationId>,
    planes: HashMap<u32, u64>,
}

/// Startup integrity registry
///
/// One process-wide instance; all operations are thread safe behind a
/// single mutex. I/O never happens while the mutex is held.
#[derive(Default)]
pub struct CheckRegistry {
    state: Mutex<RegistryState>,
}

impl CheckRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set membership check
    ///
    /// Returns `true` if this is a first-time pairing (the caller should
    /// create fresh storage rather than load).
    pub fn register_data_and_config(&self, id: DataLocationId) -> bool {
        self.state.lock().known.insert(id)
    }

    /// Forget a pairing (after its backing storage was deleted)
    pub fn remove_data(&self, id: &DataLocationId) -> bool {
        self.state.lock().known.remove(id)
    }

    /// Check membership without registering
    #[must_use]
    pub fn is_known(&self, id: &DataLocationId) -> bool {
        self.state.lock().known.contains(id)
    }

    /// Record the last durably-applied journal offset for a plane
    pub fn set_plane_position(&self, plane: u32, position: u64) {
        self.state.lock().planes.insert(plane, position);
    }

    /// Last recorded journal offset for a plane, if any
    #[must_use]
    pub fn plane_position(&self, plane: u32) -> Option<u64> {
        self.state.lock().planes.get(&plane).copied()
    }

    /// Drop a plane's cursor; returns true if one existed
    pub fn remove_plane(&self, plane: u32) -> bool {
        self.state.lock().planes.remove(&plane).is_some()
    }

    /// Number of known pairings
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().known.len()
    }

    /// Check whether no pairing is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().known.is_empty()
    }

    /// Load the registry from its side-file, best-effort
    ///
    /// Any failure (missing file, bad magic, checksum mismatch, decode
    /// error) leaves the registry empty and returns `false`.
    pub fn load(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no check side-file, starting empty");
                return false;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read check side-file");
                return false;
            }
        };

        match Self::decode(&bytes) {
            Ok(state) => {
                debug!(
                    path = %path.display(),
                    known = state.known.len(),
                    planes = state.planes.len(),
                    "loaded check registry"
                );
                *self.state.lock() = state;
                true
            }
            Err(reason) => {
                warn!(path = %path.display(), reason, "invalid check side-file, starting empty");
                false
            }
        }
    }

    /// Save the registry to its side-file, best-effort
    ///
    /// The state is snapshotted under the lock; serialization and the
    /// write happen with the lock released, so a torn write cannot mix
    /// two generations of the maps.
    pub fn save(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let snapshot = {
            let state = self.state.lock();
            RegistryState {
                known: state.known.clone(),
                planes: state.planes.clone(),
            }
        };

        let body = match bincode::serialize(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode check registry");
                return false;
            }
        };

        let mut bytes = Vec::with_capacity(body.len() + 9);
        bytes.extend_from_slice(&CHECK_MAGIC.to_le_bytes());
        bytes.push(CHECK_VERSION);
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %path.display(), error = %e, "failed to create check directory");
                return false;
            }
        }
        match std::fs::write(path, &bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write check side-file");
                false
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<RegistryState, &'static str> {
        if bytes.len() < 9 {
            return Err("truncated");
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().map_err(|_| "truncated")?);
        if magic != CHECK_MAGIC {
            return Err("bad magic");
        }
        if bytes[4] != CHECK_VERSION {
            return Err("unsupported version");
        }
        let body = &bytes[5..bytes.len() - 4];
        let stored_crc = u32::from_le_bytes(
            bytes[bytes.len() - 4..]
                .try_into()
                .map_err(|_| "truncated")?,
        );
        if crc32c::crc32c(body) != stored_crc {
            return Err("checksum mismatch");
        }
        bincode::deserialize(body).map_err(|_| "decode failure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn counter_id() -> DataLocationId {
        DataLocationId::new("Counter", FileLocation::local("data/counter.bin"))
    }

    #[test]
    fn test_register_is_test_and_set() {
        let registry = CheckRegistry::new();
        assert!(registry.register_data_and_config(counter_id()));
        assert!(!registry.register_data_and_config(counter_id()));
        assert!(registry.is_known(&counter_id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_plane_positions() {
        let registry = CheckRegistry::new();
        assert_eq!(registry.plane_position(3), None);

        registry.set_plane_position(3, 4096);
        registry.set_plane_position(3, 8192);
        assert_eq!(registry.plane_position(3), Some(8192));

        assert!(registry.remove_plane(3));
        assert!(!registry.remove_plane(3));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check.bin");

        let registry = CheckRegistry::new();
        registry.register_data_and_config(counter_id());
        registry.set_plane_position(1, 100);
        registry.set_plane_position(2, 200);
        assert!(registry.save(&path));

        let reloaded = CheckRegistry::new();
        assert!(reloaded.load(&path));
        assert!(reloaded.is_known(&counter_id()));
        assert_eq!(reloaded.plane_position(1), Some(100));
        assert_eq!(reloaded.plane_position(2), Some(200));
    }

    #[test]
    fn test_load_missing_file_leaves_empty() {
        let dir = tempdir().unwrap();
        let registry = CheckRegistry::new();
        assert!(!registry.load(dir.path().join("absent.bin")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_leaves_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check.bin");

        let registry = CheckRegistry::new();
        registry.register_data_and_config(counter_id());
        assert!(registry.save(&path));

        // Flip a byte in the body: the checksum must reject the file
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reloaded = CheckRegistry::new();
        assert!(!reloaded.load(&path));
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_remove_data() {
        let registry = CheckRegistry::new();
        registry.register_data_and_config(counter_id());
        assert!(registry.remove_data(&counter_id()));
        // A deleted pairing registers as first-time again
        assert!(registry.register_data_and_config(counter_id()));
    }
}
