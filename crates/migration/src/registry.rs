#![forbid(unsafe_code)]

//! The compiled-in migration list.
//!
//! Append-only: entries stay sorted by strictly ascending target version,
//! duplicates are forbidden, and shipped entries are never modified or
//! reordered. No runtime registration; the list is data.

use flotilla_core::Version;
use futures_util::future::BoxFuture;

use crate::steps::{self, StepContext, StepError};
use crate::MigrationError;

/// Stores written by anything older than this cannot be brought forward.
pub const MIN_SUPPORTED_STORAGE_VERSION: Version = Version::new(0, 3, 0);

pub type StepFn = for<'a> fn(&'a StepContext) -> BoxFuture<'a, Result<(), StepError>>;

pub enum MigrationAction {
    /// Refuse with the given message. Presence of such an entry guarantees
    /// ancient states surface a clean error instead of silently succeeding.
    LegacyRefuse(&'static str),
    DataRewrite(StepFn),
}

pub struct MigrationEntry {
    pub target: Version,
    pub action: MigrationAction,
}

pub fn entries() -> Vec<MigrationEntry> {
    vec![
        MigrationEntry {
            target: Version::new(0, 7, 0),
            action: MigrationAction::LegacyRefuse("migration from 0.7.x not supported anymore"),
        },
        MigrationEntry {
            target: Version::new(0, 11, 0),
            action: MigrationAction::DataRewrite(steps::add_version_info),
        },
        MigrationEntry {
            target: Version::new(0, 13, 0),
            action: MigrationAction::DataRewrite(steps::rekey_tasks_and_rename_framework_id),
        },
    ]
}

/// Entries with a target above `from`, ascending (the list itself is kept
/// sorted).
pub fn applicable<'a>(
    entries: &'a [MigrationEntry],
    from: Version,
) -> impl Iterator<Item = &'a MigrationEntry> + 'a {
    entries.iter().filter(move |entry| entry.target > from)
}

/// The empty sentinel (first-ever start) skips the minimum check entirely.
pub fn ensure_supported(from: &Version) -> Result<(), MigrationError> {
    if !from.is_empty() && *from < MIN_SUPPORTED_STORAGE_VERSION {
        return Err(MigrationError::UnsupportedVersion {
            min: MIN_SUPPORTED_STORAGE_VERSION,
            from: *from,
        });
    }
    Ok(())
}
