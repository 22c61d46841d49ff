use std::sync::Arc;

use zarrs::filesystem::FilesystemStore;
use zarrs::storage::{
    ListableStorageTraits, ReadableStorageTraits, ReadableWritableListableStorage, StoreKey,
    StorePrefix, WritableStorageTraits,
};

pub use zarrs::storage::store::MemoryStore;

use crate::domain::{Location, Scheme};
use crate::error::IngestError;

pub fn store_key(key: &str) -> Result<StoreKey, IngestError> {
    StoreKey::new(key.trim_matches('/')).map_err(|err| IngestError::storage(key, err))
}

pub fn dir_prefix(key: &str) -> Result<StorePrefix, IngestError> {
    let key = key.trim_matches('/');
    if key.is_empty() {
        return Ok(StorePrefix::root());
    }
    StorePrefix::new(format!("{key}/")).map_err(|err| IngestError::storage(key, err))
}

pub fn get<S: ReadableStorageTraits + ?Sized>(
    store: &S,
    key: &str,
) -> Result<Option<Vec<u8>>, IngestError> {
    store
        .get(&store_key(key)?)
        .map(|value| value.map(|bytes| bytes.to_vec()))
        .map_err(|err| IngestError::storage(key, err))
}

pub fn exists<S: ReadableStorageTraits + ?Sized>(store: &S, key: &str) -> Result<bool, IngestError> {
    store
        .size_key(&store_key(key)?)
        .map(|size| size.is_some())
        .map_err(|err| IngestError::storage(key, err))
}

pub fn put<S: WritableStorageTraits + ?Sized>(
    store: &S,
    key: &str,
    content: Vec<u8>,
) -> Result<(), IngestError> {
    store
        .set(&store_key(key)?, content.into())
        .map_err(|err| IngestError::storage(key, err))
}

pub fn erase_dir<S: WritableStorageTraits + ?Sized>(store: &S, key: &str) -> Result<(), IngestError> {
    store
        .erase_prefix(&dir_prefix(key)?)
        .map_err(|err| IngestError::storage(key, err))
}

pub fn list<S: ListableStorageTraits + ?Sized>(
    store: &S,
    prefix: &str,
) -> Result<Vec<String>, IngestError> {
    let mut keys: Vec<String> = store
        .list_prefix(&dir_prefix(prefix)?)
        .map_err(|err| IngestError::storage(prefix, err))?
        .into_iter()
        .map(|key| key.as_str().to_string())
        .collect();
    keys.sort();
    Ok(keys)
}

/// Maps location schemes to zarrs stores. `file://` keys are paths below `/`.
#[derive(Clone)]
pub struct Backends {
    memory: Arc<MemoryStore>,
}

impl Backends {
    pub fn new() -> Self {
        Self::with_memory(Arc::new(MemoryStore::new()))
    }

    pub fn with_memory(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }

    pub fn resolve(&self, location: &Location) -> Result<ReadableWritableListableStorage, IngestError> {
        let storage: ReadableWritableListableStorage = match location.scheme() {
            Scheme::File => Arc::new(
                FilesystemStore::new("/").map_err(|err| IngestError::storage("/", err))?,
            ),
            Scheme::Memory => self.memory.clone(),
        };
        Ok(storage)
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self::new()
    }
}
