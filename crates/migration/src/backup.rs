#![forbid(unsafe_code)]

//! Snapshot/restore of live state around a migration run.
//!
//! Backups live under a version-qualified prefix
//! (`<backupPrefix>_<M>.<m>.<p>/…`) so historical snapshots coexist, each
//! keyed to the exact schema it represents. The engine never deletes old
//! backups; retention is an operator concern.

use std::sync::Arc;

use flotilla_core::Version;
use flotilla_storage::{upsert, KvStore, StoreError};
use futures_util::future::try_join_all;

pub struct BackupManager {
    store: Arc<dyn KvStore>,
    state_prefix: String,
    backup_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    /// No live state, nothing to protect.
    Empty,
    /// A fresh snapshot was taken.
    Stored,
    /// A snapshot from a crashed run was found and copied back over state.
    Restored,
}

impl BackupManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        state_prefix: impl Into<String>,
        backup_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            state_prefix: state_prefix.into(),
            backup_prefix: backup_prefix.into(),
        }
    }

    pub fn backup_path(&self, version: &Version) -> String {
        format!(
            "{}_{}.{}.{}",
            self.backup_prefix, version.major, version.minor, version.patch
        )
    }

    /// Decide between snapshot and restore before any step runs.
    ///
    /// The probe inspects only the first state id: if its backup twin exists,
    /// a prior run crashed after starting its backup and the snapshot wins;
    /// otherwise live state is authoritative and gets snapshotted. Sound
    /// because every live key shares the state prefix discipline.
    pub async fn backup_or_restore(&self, from: &Version) -> Result<BackupOutcome, StoreError> {
        let state_ids: Vec<String> = self
            .store
            .ids()
            .await?
            .into_iter()
            .filter(|id| id.starts_with(&self.state_prefix))
            .collect();
        let Some(probe) = state_ids.first() else {
            return Ok(BackupOutcome::Empty);
        };

        let backup_path = self.backup_path(from);
        let probe_backup = format!("{backup_path}{}", relative(probe, &self.state_prefix));
        if self.store.load(&probe_backup).await?.is_some() {
            tracing::info!(path = %backup_path, "found backup of a crashed migration, restoring");
            self.restore(&backup_path).await?;
            Ok(BackupOutcome::Restored)
        } else {
            tracing::info!(path = %backup_path, entries = state_ids.len(), "backing up state");
            self.store_backup(&state_ids, &backup_path).await?;
            Ok(BackupOutcome::Stored)
        }
    }

    async fn store_backup(
        &self,
        state_ids: &[String],
        backup_path: &str,
    ) -> Result<(), StoreError> {
        try_join_all(
            state_ids
                .iter()
                .map(|id| self.backup_one(id, backup_path)),
        )
        .await?;
        Ok(())
    }

    async fn backup_one(&self, id: &str, backup_path: &str) -> Result<(), StoreError> {
        let bytes = match self.store.load(id).await? {
            Some(entity) => entity.bytes,
            None => {
                // The backup key must exist even when the source vanished
                // between enumeration and load; restore relies on set
                // equality between state and backup.
                tracing::warn!(%id, "state entry vanished during backup, storing empty bytes");
                Vec::new()
            }
        };

        let backup_id = format!("{backup_path}{}", relative(id, &self.state_prefix));
        match self.store.create(&backup_id, bytes.clone()).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => {
                // Left behind by a backup attempt that crashed before writing
                // the probe key; overwrite with the live bytes.
                upsert(self.store.as_ref(), &backup_id, bytes).await?;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn restore(&self, backup_path: &str) -> Result<(), StoreError> {
        let ids = self.store.ids().await?;

        let state_ids: Vec<&String> = ids
            .iter()
            .filter(|id| id.starts_with(&self.state_prefix))
            .collect();
        try_join_all(state_ids.iter().map(|id| self.store.delete(id))).await?;

        let backup_ids: Vec<&String> = ids
            .iter()
            .filter(|id| id.starts_with(backup_path))
            .collect();
        try_join_all(
            backup_ids
                .iter()
                .map(|id| self.restore_one(id, backup_path)),
        )
        .await?;
        Ok(())
    }

    async fn restore_one(&self, backup_id: &str, backup_path: &str) -> Result<(), StoreError> {
        let bytes = match self.store.load(backup_id).await? {
            Some(entity) => entity.bytes,
            None => {
                tracing::warn!(
                    id = %backup_id,
                    "backup entry vanished during restore, storing empty bytes"
                );
                Vec::new()
            }
        };
        let state_id = format!("{}{}", self.state_prefix, relative(backup_id, backup_path));
        self.store.create(&state_id, bytes).await?;
        Ok(())
    }
}

fn relative<'a>(id: &'a str, prefix: &str) -> &'a str {
    id.strip_prefix(prefix).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use flotilla_storage::InMemoryKvStore;

    use super::*;

    const STATE: &str = "/flotilla/state";
    const BACKUP: &str = "/flotilla/backup";

    fn manager(store: &Arc<InMemoryKvStore>) -> BackupManager {
        BackupManager::new(store.clone(), STATE, BACKUP)
    }

    async fn bytes_at(store: &InMemoryKvStore, id: &str) -> Vec<u8> {
        store
            .load(id)
            .await
            .expect("load")
            .expect("present")
            .bytes
    }

    #[tokio::test]
    async fn empty_state_is_a_noop() {
        let store = Arc::new(InMemoryKvStore::new());
        // Internal keys outside the state prefix never count as state.
        store
            .create("internal:storage:migrationInProgress", Vec::new())
            .await
            .expect("create");

        let outcome = manager(&store)
            .backup_or_restore(&Version::new(0, 16, 0))
            .await
            .expect("backup");
        assert_eq!(outcome, BackupOutcome::Empty);
        assert_eq!(
            store.ids().await.expect("ids"),
            vec!["internal:storage:migrationInProgress"]
        );
    }

    #[tokio::test]
    async fn store_mode_mirrors_every_state_entry() {
        let store = Arc::new(InMemoryKvStore::new());
        store
            .create("/flotilla/state/first", b"myValue".to_vec())
            .await
            .expect("create");
        store
            .create("/flotilla/state/second", b"other".to_vec())
            .await
            .expect("create");

        let outcome = manager(&store)
            .backup_or_restore(&Version::new(0, 16, 0))
            .await
            .expect("backup");

        assert_eq!(outcome, BackupOutcome::Stored);
        assert_eq!(
            bytes_at(&store, "/flotilla/backup_0.16.0/first").await,
            b"myValue"
        );
        assert_eq!(
            bytes_at(&store, "/flotilla/backup_0.16.0/second").await,
            b"other"
        );
    }

    #[tokio::test]
    async fn partial_backup_without_probe_key_is_overwritten() {
        let store = Arc::new(InMemoryKvStore::new());
        store
            .create("/flotilla/state/a", b"live-a".to_vec())
            .await
            .expect("create");
        store
            .create("/flotilla/state/b", b"live-b".to_vec())
            .await
            .expect("create");
        // A crashed attempt wrote /b's backup but not /a's (the probe).
        store
            .create("/flotilla/backup_0.16.0/b", b"stale".to_vec())
            .await
            .expect("create");

        let outcome = manager(&store)
            .backup_or_restore(&Version::new(0, 16, 0))
            .await
            .expect("backup");

        assert_eq!(outcome, BackupOutcome::Stored);
        assert_eq!(bytes_at(&store, "/flotilla/backup_0.16.0/a").await, b"live-a");
        assert_eq!(bytes_at(&store, "/flotilla/backup_0.16.0/b").await, b"live-b");
    }

    #[tokio::test]
    async fn restore_mode_replaces_state_with_backup_bytes() {
        let store = Arc::new(InMemoryKvStore::new());
        let version = Version::new(0, 14, 0);
        store
            .create("/flotilla/state/s1", b"dirty-1".to_vec())
            .await
            .expect("create");
        store
            .create("/flotilla/state/s2", b"dirty-2".to_vec())
            .await
            .expect("create");
        store
            .create("/flotilla/backup_0.14.0/s1", b"B1".to_vec())
            .await
            .expect("create");
        store
            .create("/flotilla/backup_0.14.0/s2", b"B2".to_vec())
            .await
            .expect("create");
        // A backup at another version must not take part in the restore.
        store
            .create("/flotilla/backup_0.13.0/s1", b"ancient".to_vec())
            .await
            .expect("create");

        let outcome = manager(&store)
            .backup_or_restore(&version)
            .await
            .expect("restore");

        assert_eq!(outcome, BackupOutcome::Restored);
        assert_eq!(bytes_at(&store, "/flotilla/state/s1").await, b"B1");
        assert_eq!(bytes_at(&store, "/flotilla/state/s2").await, b"B2");
        // Backups stay in place; the engine never garbage-collects them.
        assert_eq!(bytes_at(&store, "/flotilla/backup_0.14.0/s1").await, b"B1");
    }

    #[tokio::test]
    async fn restore_drops_state_keys_missing_from_backup() {
        let store = Arc::new(InMemoryKvStore::new());
        let version = Version::new(0, 14, 0);
        store
            .create("/flotilla/state/s1", b"dirty".to_vec())
            .await
            .expect("create");
        // Sorts after s1 so the probe still hits a backed-up key.
        store
            .create("/flotilla/state/s2-extra", b"post-backup".to_vec())
            .await
            .expect("create");
        store
            .create("/flotilla/backup_0.14.0/s1", b"B1".to_vec())
            .await
            .expect("create");

        manager(&store)
            .backup_or_restore(&version)
            .await
            .expect("restore");

        assert_eq!(bytes_at(&store, "/flotilla/state/s1").await, b"B1");
        assert!(store
            .load("/flotilla/state/s2-extra")
            .await
            .expect("load")
            .is_none());
    }
}
