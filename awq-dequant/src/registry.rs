use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::{AwqError, Result};

/// Process-wide id table for objects handed across the C ABI.
///
/// Ids start at 1 so that 0 can stand for "no object". Entries are reference counted: removing an
/// id does not invalidate clones already obtained with `get`.
#[derive(Debug)]
pub struct DescriptorTable<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> Default for DescriptorTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DescriptorTable<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Arc<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, value: T) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries().insert(id, Arc::new(value));
        id
    }

    pub fn get(&self, id: u64) -> Result<Arc<T>> {
        self.entries()
            .get(&id)
            .cloned()
            .ok_or(AwqError::InvalidDescriptor(id))
    }

    pub fn remove(&self, id: u64) -> Result<Arc<T>> {
        self.entries()
            .remove(&id)
            .ok_or(AwqError::InvalidDescriptor(id))
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
