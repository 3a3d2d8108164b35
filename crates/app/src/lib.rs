#![forbid(unsafe_code)]

use std::sync::Arc;

use flotilla_core::Version;
use flotilla_migration::{Migration, MigrationConfig};
use flotilla_storage::PostgresKvStore;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub state_prefix: String,
    pub backup_prefix: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_values(
            std::env::var("DATABASE_URL").ok(),
            std::env::var("STATE_PREFIX").ok(),
            std::env::var("BACKUP_PREFIX").ok(),
        )
    }

    fn from_values(
        database_url: Option<String>,
        state_prefix: Option<String>,
        backup_prefix: Option<String>,
    ) -> anyhow::Result<Self> {
        let database_url =
            database_url.ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let state_prefix = state_prefix.ok_or_else(|| anyhow::anyhow!("STATE_PREFIX must be set"))?;
        let backup_prefix =
            backup_prefix.ok_or_else(|| anyhow::anyhow!("BACKUP_PREFIX must be set"))?;
        validate_prefixes(&state_prefix, &backup_prefix)?;

        Ok(Self {
            database_url,
            state_prefix,
            backup_prefix,
        })
    }
}

/// Run the schema migration against the configured store and return the
/// committed version.
pub async fn run(config: AppConfig) -> anyhow::Result<Version> {
    let store = Arc::new(PostgresKvStore::connect(&config.database_url).await?);
    let migration = Migration::new(
        store,
        MigrationConfig {
            state_prefix: config.state_prefix,
            backup_prefix: config.backup_prefix,
        },
    )?;

    let version = migration.migrate().await?;
    tracing::info!(version = %version, "storage schema is up to date");
    Ok(version)
}

/// Backup keys must never be mistaken for live state: the prefixes have to be
/// non-empty, and neither may be a prefix of the other.
fn validate_prefixes(state_prefix: &str, backup_prefix: &str) -> anyhow::Result<()> {
    if state_prefix.is_empty() {
        return Err(anyhow::anyhow!("STATE_PREFIX must not be empty"));
    }
    if backup_prefix.is_empty() {
        return Err(anyhow::anyhow!("BACKUP_PREFIX must not be empty"));
    }
    if state_prefix.starts_with(backup_prefix) || backup_prefix.starts_with(state_prefix) {
        return Err(anyhow::anyhow!(
            "STATE_PREFIX {state_prefix:?} and BACKUP_PREFIX {backup_prefix:?} must be disjoint"
        ));
    }
    Ok(())
}
