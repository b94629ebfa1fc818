//! In-memory byte-string storage with a memory cap.
//!
//! Owned by a single request handler on the event-loop thread, so there is
//! no locking. Writes that would push usage past the cap are refused rather
//! than evicting other keys.

use std::collections::HashMap;
use tracing::{info, trace};

/// Fixed bookkeeping charged per entry on top of key and value bytes.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<(Vec<u8>, Vec<u8>)>();

/// Result of a storage operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageResult {
    /// Operation succeeded
    Stored,
    /// Item was not stored because the memory cap would be exceeded
    NotStored,
    /// Item not found
    NotFound,
    /// Successfully deleted
    Deleted,
}

/// Single-threaded key-value storage
pub struct Storage {
    data: HashMap<Vec<u8>, Vec<u8>>,
    /// Current memory usage in bytes
    memory_used: usize,
    /// Maximum memory allowed
    max_memory: usize,
}

impl Storage {
    /// Create a new storage instance
    pub fn new(max_memory: usize) -> Self {
        info!(max_memory_mb = max_memory / 1024 / 1024, "Initializing storage");
        Self {
            data: HashMap::new(),
            memory_used: 0,
            max_memory,
        }
    }

    fn entry_size(key: &[u8], value: &[u8]) -> usize {
        ENTRY_OVERHEAD + key.len() + value.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    /// Insert or overwrite `key`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> StorageResult {
        let new_size = Self::entry_size(key, value);
        let old_size = self
            .data
            .get(key)
            .map(|old| Self::entry_size(key, old))
            .unwrap_or(0);

        if self.memory_used - old_size + new_size > self.max_memory {
            trace!(memory_used = self.memory_used, new_size, "Item rejected, memory cap");
            return StorageResult::NotStored;
        }

        self.memory_used = self.memory_used - old_size + new_size;
        match self.data.get_mut(key) {
            Some(existing) => {
                existing.clear();
                existing.extend_from_slice(value);
            }
            None => {
                self.data.insert(key.to_vec(), value.to_vec());
            }
        }

        trace!(memory_used = self.memory_used, "Item stored");
        StorageResult::Stored
    }

    pub fn delete(&mut self, key: &[u8]) -> StorageResult {
        match self.data.remove(key) {
            Some(value) => {
                self.memory_used -= Self::entry_size(key, &value);
                StorageResult::Deleted
            }
            None => StorageResult::NotFound,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }
}
