#![forbid(unsafe_code)]

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{Entity, KvStore, StoreError, StoreManagement};

/// Production adapter: one `entities` table keyed by id, with a `revision`
/// column backing optimistic updates.
#[derive(Clone)]
pub struct PostgresKvStore {
    pool: PgPool,
}

impl PostgresKvStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(unavailable)?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KvStore for PostgresKvStore {
    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT id FROM entities ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)
    }

    async fn load(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT id, bytes, revision FROM entities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(Into::into))
    }

    async fn create(&self, id: &str, bytes: Vec<u8>) -> Result<Entity, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            INSERT INTO entities (id, bytes, revision)
            VALUES ($1, $2, 1)
            RETURNING id, bytes, revision
            "#,
        )
        .bind(id)
        .bind(&bytes)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                StoreError::AlreadyExists(id.to_owned())
            } else {
                unavailable(error)
            }
        })?;

        Ok(row.into())
    }

    async fn update(&self, entity: Entity) -> Result<Entity, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            UPDATE entities
            SET bytes = $2, revision = revision + 1
            WHERE id = $1 AND revision = $3
            RETURNING id, bytes, revision
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.bytes)
        .bind(entity.revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT revision FROM entities WHERE id = $1")
                        .bind(&entity.id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(unavailable)?;
                Err(match exists {
                    Some(_) => StoreError::StaleRevision(entity.id),
                    None => StoreError::NotFound(entity.id),
                })
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    fn management(&self) -> Option<&dyn StoreManagement> {
        Some(self)
    }
}

#[async_trait]
impl StoreManagement for PostgresKvStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                bytes BYTEA NOT NULL,
                revision BIGINT NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    bytes: Vec<u8>,
    revision: i64,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Self {
            id: row.id,
            bytes: row.bytes,
            revision: row.revision,
        }
    }
}

fn unavailable(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505")
    )
}
