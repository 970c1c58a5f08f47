//! Persistent storage engines and the common interface they expose.

pub mod cuckoo;

use bytes::Bytes;

/// An interface for a key-value store that can be shared across threads.
pub trait KeyValueStorage: Send + Sync {
    /// Error returned by the storage engine.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Set the value of a key, overwriting any existing value at that key.
    fn set(&self, key: Bytes, value: Bytes) -> Result<(), Self::Error>;

    /// Get the value of a key, if it exists.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Self::Error>;

    /// Delete a key. Later reads of the key return nothing until it is set
    /// again.
    fn del(&self, key: Bytes) -> Result<(), Self::Error>;
}
