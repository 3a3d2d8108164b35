#![forbid(unsafe_code)]

use async_trait::async_trait;

mod memory;
mod postgres;
mod repository;

pub use memory::InMemoryKvStore;
pub use postgres::PostgresKvStore;
pub use repository::{
    state_key, AppRepository, GroupRepository, RepositoryError, TaskRepository,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("entity {0:?} already exists")]
    AlreadyExists(String),
    #[error("entity {0:?} was updated concurrently")]
    StaleRevision(String),
    #[error("entity {0:?} not found")]
    NotFound(String),
}

/// A persisted key/value pair together with the store's optimistic-update
/// token. `bytes` is opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub bytes: Vec<u8>,
    pub revision: i64,
}

impl Entity {
    #[must_use]
    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.bytes = bytes;
        self
    }
}

/// The capability set the migration engine requires from the external store.
/// No ordering or atomicity across keys is assumed.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All persisted ids, ascending.
    async fn ids(&self) -> Result<Vec<String>, StoreError>;

    async fn load(&self, id: &str) -> Result<Option<Entity>, StoreError>;

    async fn create(&self, id: &str, bytes: Vec<u8>) -> Result<Entity, StoreError>;

    /// Replace an entity's bytes, guarded by its revision.
    async fn update(&self, entity: Entity) -> Result<Entity, StoreError>;

    /// Returns whether the entity existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Present only on adapters that can set up their own backing schema.
    fn management(&self) -> Option<&dyn StoreManagement> {
        None
    }
}

#[async_trait]
pub trait StoreManagement: Send + Sync {
    async fn initialize(&self) -> Result<(), StoreError>;
}

/// Update-if-exists, create-otherwise. The store gives no cross-key
/// atomicity, so this is only sound while the caller holds exclusive access.
pub async fn upsert(store: &dyn KvStore, id: &str, bytes: Vec<u8>) -> Result<Entity, StoreError> {
    match store.load(id).await? {
        Some(entity) => store.update(entity.with_bytes(bytes)).await,
        None => store.create(id, bytes).await,
    }
}
