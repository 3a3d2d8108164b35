#![forbid(unsafe_code)]

//! Per-version data rewrites.

use std::sync::Arc;

use flotilla_core::{CodecError, Version};
use flotilla_storage::{
    AppRepository, GroupRepository, KvStore, RepositoryError, StoreError, TaskRepository,
};

use crate::MigrationError;

mod add_version_info;
mod rekey_tasks;

pub use add_version_info::add_version_info;
pub use rekey_tasks::rekey_tasks_and_rename_framework_id;

/// Everything a data-rewrite step may touch.
pub struct StepContext {
    pub store: Arc<dyn KvStore>,
    pub apps: AppRepository,
    pub groups: GroupRepository,
    pub tasks: TaskRepository,
    pub state_prefix: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("corrupt legacy task record at {0:?}")]
    CorruptLegacyTask(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<RepositoryError> for StepError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Store(error) => Self::Store(error),
            RepositoryError::Codec(error) => Self::Codec(error),
        }
    }
}

impl StepError {
    /// Typed failures surface unchanged; anything codec-shaped becomes the
    /// step's wrapped failure.
    pub(crate) fn into_migration_error(self, target: Version) -> MigrationError {
        match self {
            Self::Store(error) => MigrationError::Store(error),
            Self::CorruptLegacyTask(key) => MigrationError::CorruptLegacyTask(key),
            Self::Codec(error) => MigrationError::Failed {
                target,
                message: error.to_string(),
            },
        }
    }
}
