//! Incrementally built display data.
//!
//! Foreign or concurrent producers cannot hand back a complete [`Data`] in one
//! call. Instead they create an empty [`SyncedData`] in the process-wide
//! registry, fill it field by field through its id, and the consumer takes a
//! deep copy once and deletes the entry.

use std::sync::{OnceLock, RwLock};

use super::{Data, MimeValue};
use crate::registry::ObjectRegistry;
use crate::types::Result;

/// Lock-guarded [`Data`] under construction.
#[derive(Debug, Default)]
pub struct SyncedData {
    inner: RwLock<Data>,
}

impl SyncedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the data under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Data) -> R) -> R {
        let mut data = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data)
    }

    /// Deep copy of the current contents, taken under the read lock.
    pub fn snapshot(&self) -> Data {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .deep_copy()
    }
}

static DATA_STORE: OnceLock<ObjectRegistry<SyncedData>> = OnceLock::new();

/// Process-wide registry of data under construction.
pub fn data_store() -> &'static ObjectRegistry<SyncedData> {
    DATA_STORE.get_or_init(ObjectRegistry::new)
}

/// Create an empty entry and return its id.
pub fn new_data() -> Result<u64> {
    data_store().store(SyncedData::new())
}

/// Drop an entry without reading it.
pub fn delete_data(id: u64) {
    data_store().delete(id);
}

/// Set `data[mime_type]` to a string value. Unknown ids are ignored.
pub fn add_string_data(id: u64, mime_type: &str, value: impl Into<String>) {
    with_entry(id, |data| data.data.insert(mime_type, value.into()));
}

/// Set `data[mime_type]` to a byte buffer. Unknown ids are ignored.
pub fn add_bytes_data(id: u64, mime_type: &str, value: Vec<u8>) {
    with_entry(id, |data| data.data.insert(mime_type, value));
}

/// Append one line to the `traceback` sequence in `data`.
pub fn append_traceback(id: u64, line: impl Into<String>) {
    with_entry(id, |data| match data.data.lines_entry("traceback") {
        Some(lines) => lines.push(line.into()),
        None => tracing::warn!("Data {}: traceback is not a sequence, line dropped", id),
    });
}

/// Set `metadata[mime_type][key]` to a string value.
pub fn add_metadata(id: u64, mime_type: &str, key: &str, value: impl Into<String>) {
    with_entry(id, |data| match data.metadata.map_entry(mime_type) {
        Some(meta) => meta.insert(key, MimeValue::Text(value.into())),
        None => tracing::warn!("Data {}: metadata for {} is not a map", id, mime_type),
    });
}

/// Deep copy the finished data and remove the entry.
pub fn take_data(id: u64) -> Option<Data> {
    let store = data_store();
    let data = store.get(id).map(|synced| synced.snapshot());
    store.delete(id);
    data
}

fn with_entry(id: u64, f: impl FnOnce(&mut Data)) {
    match data_store().get(id) {
        Some(synced) => synced.update(f),
        None => tracing::debug!("Data {} not in registry, update ignored", id),
    }
}
