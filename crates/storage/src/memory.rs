#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::{Entity, KvStore, StoreError};

/// In-memory adapter with the same revision discipline as the Postgres store.
/// No management capability; `initialize()` is a no-op for it.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    bytes: Vec<u8>,
    revision: i64,
}

impl InMemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn load(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.lock().get(id).map(|entry| Entity {
            id: id.to_owned(),
            bytes: entry.bytes.clone(),
            revision: entry.revision,
        }))
    }

    async fn create(&self, id: &str, bytes: Vec<u8>) -> Result<Entity, StoreError> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_owned()));
        }
        entries.insert(
            id.to_owned(),
            StoredEntry {
                bytes: bytes.clone(),
                revision: 1,
            },
        );
        Ok(Entity {
            id: id.to_owned(),
            bytes,
            revision: 1,
        })
    }

    async fn update(&self, entity: Entity) -> Result<Entity, StoreError> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&entity.id) else {
            return Err(StoreError::NotFound(entity.id));
        };
        if entry.revision != entity.revision {
            return Err(StoreError::StaleRevision(entity.id));
        }
        entry.bytes = entity.bytes.clone();
        entry.revision += 1;
        Ok(Entity {
            revision: entry.revision,
            ..entity
        })
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(id).is_some())
    }
}
