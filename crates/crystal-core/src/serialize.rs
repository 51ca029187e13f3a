//! Serialization capability
//!
//! Registered types round-trip through a compact binary format (bincode)
//! or a UTF-8 text format (serde_json), selected per crystal via
//! [`SaveFormat`]. Default reconstruction backs the first-run path where
//! no stored data exists yet.

use bytes::Bytes;
use crystal_common::{Error, Result, SaveFormat};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marker for types a crystal can own
///
/// Blanket-implemented: any serde-capable type with a default instance
/// qualifies.
pub trait CrystalObject: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> CrystalObject for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

/// Serialize `value` in the given format
pub fn serialize_object<T: Serialize>(value: &T, format: SaveFormat) -> Result<Bytes> {
    let bytes = match format {
        SaveFormat::Binary => bincode::serialize(value)
            .map_err(|e| Error::serialization(format!("bincode encode: {e}")))?,
        SaveFormat::Utf8 => serde_json::to_vec(value)
            .map_err(|e| Error::serialization(format!("json encode: {e}")))?,
    };
    Ok(Bytes::from(bytes))
}

/// Reconstruct a value from stored bytes
pub fn deserialize_object<T: DeserializeOwned>(bytes: &[u8], format: SaveFormat) -> Result<T> {
    match format {
        SaveFormat::Binary => bincode::deserialize(bytes)
            .map_err(|e| Error::serialization(format!("bincode decode: {e}"))),
        SaveFormat::Utf8 => serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("json decode: {e}"))),
    }
}

/// Default-reconstruct a value (the first-run path)
#[must_use]
pub fn reconstruct_default<T: Default>() -> T {
    T::default()
}
