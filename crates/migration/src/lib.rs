#![forbid(unsafe_code)]

//! Schema migration engine for the scheduler's persistent state store.
//!
//! Runs once per process start, before the scheduler accepts work: detect the
//! stored schema version, refuse unsupported ones, snapshot live state so a
//! crashed run can be recovered, apply the registered transformations in
//! strictly ascending target order, persist the new version marker, release
//! the in-progress guard.

use std::sync::Arc;

use flotilla_core::{Version, VersionError};
use flotilla_storage::{
    upsert, AppRepository, GroupRepository, KvStore, StoreError, TaskRepository,
};

pub mod backup;
pub mod registry;
pub mod steps;


use backup::BackupManager;
use registry::{MigrationAction, MigrationEntry};
use steps::StepContext;

/// Holds the serialized schema version of the store's current layout.
pub const STORAGE_VERSION_KEY: &str = "internal:storage:version";

/// Existence of this key is the lease: a migration is running, or crashed
/// mid-flight and must be recovered before anything else touches the store.
pub const MIGRATION_IN_PROGRESS_KEY: &str = "internal:storage:migrationInProgress";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Migration from versions < {min} is not supported. Your version: {from}")]
    UnsupportedVersion { min: Version, from: Version },
    #[error("{0}")]
    UnsupportedLegacy(&'static str),
    #[error("Migration already in progress. If no migration is actually running, remove the 'internal:storage:migrationInProgress' key from the store and restart")]
    AlreadyInProgress,
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("corrupt legacy task record at {0:?}")]
    CorruptLegacyTask(String),
    #[error("migration to {target} failed: {message}")]
    Failed { target: Version, message: String },
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Prefix of all live state ids, e.g. `/flotilla/state`.
    pub state_prefix: String,
    /// Prefix of version-qualified snapshots, e.g. `/flotilla/backup`. Must
    /// be disjoint from the state prefix.
    pub backup_prefix: String,
}

pub struct Migration {
    store: Arc<dyn KvStore>,
    config: MigrationConfig,
    current: Version,
    entries: Vec<MigrationEntry>,
    apps: AppRepository,
    groups: GroupRepository,
    tasks: TaskRepository,
}

impl Migration {
    /// Fails with `BadBuildVersion` when the binary's build metadata does not
    /// carry a parseable version; nothing useful can run without a target.
    pub fn new(store: Arc<dyn KvStore>, config: MigrationConfig) -> Result<Self, MigrationError> {
        let current = Version::current_from_build()?;
        let apps = AppRepository::new(store.clone(), config.state_prefix.clone());
        let groups = GroupRepository::new(store.clone(), config.state_prefix.clone());
        let tasks = TaskRepository::new(store.clone(), config.state_prefix.clone());
        Ok(Self {
            store,
            config,
            current,
            entries: registry::entries(),
            apps,
            groups,
            tasks,
        })
    }

    /// The schema version this binary migrates to.
    pub fn target_version(&self) -> Version {
        self.current
    }

    /// Bring the store's schema forward to the current version. Returns the
    /// committed version. On any failure after the guard is taken, the
    /// in-progress key stays behind so the next run detects the abort and
    /// restores from backup.
    pub async fn migrate(&self) -> Result<Version, MigrationError> {
        if let Some(management) = self.store.management() {
            management.initialize().await?;
        }

        let from = self.current_storage_version().await?;
        registry::ensure_supported(&from)?;

        self.acquire_guard().await?;
        tracing::info!(from = %from, to = %self.current, "starting storage migration");

        let backup = BackupManager::new(
            self.store.clone(),
            &self.config.state_prefix,
            &self.config.backup_prefix,
        );
        backup.backup_or_restore(&from).await?;

        let applied = self.apply_migration_steps(from).await?;

        self.store_version().await?;
        self.release_guard().await?;

        tracing::info!(
            version = %self.current,
            steps = applied.len(),
            "storage migration complete"
        );
        Ok(self.current)
    }

    /// The persisted schema version, or the binary's own version when none
    /// has ever been stored. Read-only; safe before `migrate()`.
    pub async fn current_storage_version(&self) -> Result<Version, MigrationError> {
        match self.store.load(STORAGE_VERSION_KEY).await? {
            Some(entity) => Ok(Version::parse(&entity.bytes)?),
            None => Ok(self.current),
        }
    }

    /// Run every registered step with a target above `from`, in ascending
    /// order, and return the targets applied. Public so the suite can drive
    /// the step pipeline without the surrounding guard and backup machinery.
    pub async fn apply_migration_steps(
        &self,
        from: Version,
    ) -> Result<Vec<Version>, MigrationError> {
        registry::ensure_supported(&from)?;

        let context = self.step_context();
        let mut applied = Vec::new();
        for entry in registry::applicable(&self.entries, from) {
            tracing::info!(target = %entry.target, "applying migration step");
            match entry.action {
                MigrationAction::LegacyRefuse(message) => {
                    return Err(MigrationError::UnsupportedLegacy(message));
                }
                MigrationAction::DataRewrite(step) => {
                    step(&context)
                        .await
                        .map_err(|error| error.into_migration_error(entry.target))?;
                }
            }
            applied.push(entry.target);
        }
        Ok(applied)
    }

    fn step_context(&self) -> StepContext {
        StepContext {
            store: self.store.clone(),
            apps: self.apps.clone(),
            groups: self.groups.clone(),
            tasks: self.tasks.clone(),
            state_prefix: self.config.state_prefix.clone(),
        }
    }

    async fn acquire_guard(&self) -> Result<(), MigrationError> {
        if self.store.load(MIGRATION_IN_PROGRESS_KEY).await?.is_some() {
            return Err(MigrationError::AlreadyInProgress);
        }
        match self.store.create(MIGRATION_IN_PROGRESS_KEY, Vec::new()).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => Err(MigrationError::AlreadyInProgress),
            Err(error) => Err(error.into()),
        }
    }

    async fn store_version(&self) -> Result<(), MigrationError> {
        upsert(
            self.store.as_ref(),
            STORAGE_VERSION_KEY,
            self.current.serialize(),
        )
        .await?;
        Ok(())
    }

    async fn release_guard(&self) -> Result<(), MigrationError> {
        if !self.store.delete(MIGRATION_IN_PROGRESS_KEY).await? {
            tracing::warn!("migration in-progress key was already removed");
        }
        Ok(())
    }
}
