#![forbid(unsafe_code)]

//! Domain repositories over the raw entity store.
//!
//! Live state keys all sit under the configured state prefix:
//! `<prefix>/app:<id>`, `<prefix>/app:<id>:<configVersion>`,
//! `<prefix>/group:root`, `<prefix>/task:<taskId>`. App ids must not contain
//! a colon; config versions may (RFC 3339 timestamps do).

use std::sync::Arc;

use flotilla_core::codec;
use flotilla_core::state::{AppDefinition, Group, Task};

use crate::{upsert, KvStore, StoreError};

const APP_PREFIX: &str = "app:";
const GROUP_ROOT: &str = "group:root";
const TASK_PREFIX: &str = "task:";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] flotilla_core::CodecError),
}

/// Absolute store id for a relative state key.
pub fn state_key(state_prefix: &str, relative: &str) -> String {
    format!("{state_prefix}/{relative}")
}

#[derive(Clone)]
pub struct AppRepository {
    store: Arc<dyn KvStore>,
    state_prefix: String,
}

impl AppRepository {
    pub fn new(store: Arc<dyn KvStore>, state_prefix: impl Into<String>) -> Self {
        Self {
            store,
            state_prefix: state_prefix.into(),
        }
    }

    fn current_key(&self, id: &str) -> String {
        state_key(&self.state_prefix, &format!("{APP_PREFIX}{id}"))
    }

    fn version_key(&self, id: &str, version: &str) -> String {
        format!("{}:{version}", self.current_key(id))
    }

    /// App ids that have a current record.
    pub async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let prefix = state_key(&self.state_prefix, APP_PREFIX);
        Ok(self
            .store
            .ids()
            .await?
            .into_iter()
            .filter_map(|id| id.strip_prefix(&prefix).map(str::to_owned))
            .filter(|relative| !relative.contains(':'))
            .collect())
    }

    /// Stored config versions for an app, ascending.
    pub async fn versions(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}:", self.current_key(id));
        let mut versions: Vec<String> = self
            .store
            .ids()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_owned))
            .collect();
        versions.sort();
        Ok(versions)
    }

    pub async fn load(
        &self,
        id: &str,
        version: &str,
    ) -> Result<Option<AppDefinition>, RepositoryError> {
        match self.store.load(&self.version_key(id, version)).await? {
            Some(entity) => Ok(Some(codec::decode_record(&entity.bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the app under its version-qualified key and as the current
    /// record.
    pub async fn store(&self, app: &AppDefinition) -> Result<(), RepositoryError> {
        let bytes = codec::encode_record(app)?;
        upsert(
            self.store.as_ref(),
            &self.version_key(&app.id, &app.version),
            bytes.clone(),
        )
        .await?;
        upsert(self.store.as_ref(), &self.current_key(&app.id), bytes).await?;
        Ok(())
    }

    /// Remove the current record and every stored config version.
    pub async fn expunge(&self, id: &str) -> Result<(), StoreError> {
        let current = self.current_key(id);
        let version_prefix = format!("{current}:");
        for key in self.store.ids().await? {
            if key == current || key.starts_with(&version_prefix) {
                self.store.delete(&key).await?;
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct GroupRepository {
    store: Arc<dyn KvStore>,
    state_prefix: String,
}

impl GroupRepository {
    pub fn new(store: Arc<dyn KvStore>, state_prefix: impl Into<String>) -> Self {
        Self {
            store,
            state_prefix: state_prefix.into(),
        }
    }

    fn root_key(&self) -> String {
        state_key(&self.state_prefix, GROUP_ROOT)
    }

    pub async fn root(&self) -> Result<Option<Group>, RepositoryError> {
        match self.store.load(&self.root_key()).await? {
            Some(entity) => Ok(Some(codec::decode_record(&entity.bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn store_root(&self, group: &Group) -> Result<(), RepositoryError> {
        let bytes = codec::encode_record(group)?;
        upsert(self.store.as_ref(), &self.root_key(), bytes).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct TaskRepository {
    store: Arc<dyn KvStore>,
    state_prefix: String,
}

impl TaskRepository {
    pub fn new(store: Arc<dyn KvStore>, state_prefix: impl Into<String>) -> Self {
        Self {
            store,
            state_prefix: state_prefix.into(),
        }
    }

    fn task_key(&self, relative: &str) -> String {
        state_key(&self.state_prefix, &format!("{TASK_PREFIX}{relative}"))
    }

    /// Relative task keys (the portion after `task:`), ascending.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let prefix = state_key(&self.state_prefix, TASK_PREFIX);
        Ok(self
            .store
            .ids()
            .await?
            .into_iter()
            .filter_map(|id| id.strip_prefix(&prefix).map(str::to_owned))
            .collect())
    }

    /// Raw stored bytes for a relative key; the 0.13 rewrite decodes legacy
    /// frames itself.
    pub async fn load_bytes(&self, relative: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .store
            .load(&self.task_key(relative))
            .await?
            .map(|entity| entity.bytes))
    }

    pub async fn store(&self, task: &Task) -> Result<(), RepositoryError> {
        let bytes = codec::encode_record(task)?;
        upsert(self.store.as_ref(), &self.task_key(&task.id), bytes).await?;
        Ok(())
    }

    pub async fn expunge(&self, relative: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.task_key(relative)).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use flotilla_core::state::VersionInfo;

    use super::*;
    use crate::InMemoryKvStore;

    const PREFIX: &str = "/flotilla/state";

    fn repo_store() -> Arc<dyn KvStore> {
        Arc::new(InMemoryKvStore::new())
    }

    fn app(id: &str, version: &str) -> AppDefinition {
        AppDefinition {
            id: id.to_owned(),
            cmd: Some("run".to_owned()),
            args: Vec::new(),
            env: BTreeMap::new(),
            instances: 1,
            version: version.to_owned(),
            version_info: None,
        }
    }

    #[tokio::test]
    async fn app_store_writes_current_and_versioned_records() {
        let store = repo_store();
        let apps = AppRepository::new(store.clone(), PREFIX);

        apps.store(&app("/web", "v1")).await.expect("store");
        apps.store(&app("/web", "v2")).await.expect("store");

        assert_eq!(apps.ids().await.expect("ids"), vec!["/web"]);
        assert_eq!(apps.versions("/web").await.expect("versions"), vec!["v1", "v2"]);

        let ids = store.ids().await.expect("ids");
        assert!(ids.contains(&"/flotilla/state/app:/web".to_owned()));
        assert!(ids.contains(&"/flotilla/state/app:/web:v1".to_owned()));
        assert!(ids.contains(&"/flotilla/state/app:/web:v2".to_owned()));
    }

    #[tokio::test]
    async fn app_versions_tolerate_colons_in_config_versions() {
        let apps = AppRepository::new(repo_store(), PREFIX);
        apps.store(&app("/web", "2015-04-09T09:56:42Z"))
            .await
            .expect("store");

        assert_eq!(
            apps.versions("/web").await.expect("versions"),
            vec!["2015-04-09T09:56:42Z"]
        );
        let loaded = apps
            .load("/web", "2015-04-09T09:56:42Z")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.version, "2015-04-09T09:56:42Z");
    }

    #[tokio::test]
    async fn app_expunge_removes_all_records() {
        let store = repo_store();
        let apps = AppRepository::new(store.clone(), PREFIX);
        apps.store(&app("/web", "v1")).await.expect("store");
        apps.store(&app("/web", "v2")).await.expect("store");
        apps.store(&app("/other", "v1")).await.expect("store");

        apps.expunge("/web").await.expect("expunge");

        assert_eq!(apps.ids().await.expect("ids"), vec!["/other"]);
        assert!(apps.versions("/web").await.expect("versions").is_empty());
    }

    #[tokio::test]
    async fn group_root_round_trip() {
        let groups = GroupRepository::new(repo_store(), PREFIX);
        assert!(groups.root().await.expect("root").is_none());

        let mut root = Group::empty_root();
        root.apps.insert(
            "/web".to_owned(),
            app("/web", "v1").with_version_info(VersionInfo::for_new_config("v1")),
        );
        groups.store_root(&root).await.expect("store");

        let loaded = groups.root().await.expect("root").expect("present");
        assert_eq!(loaded, root);
    }

    #[tokio::test]
    async fn task_keys_are_relative_and_sorted() {
        let store = repo_store();
        let tasks = TaskRepository::new(store.clone(), PREFIX);

        tasks
            .store(&Task {
                id: "web.b".to_owned(),
                app_id: "/web".to_owned(),
                host: None,
            })
            .await
            .expect("store");
        tasks
            .store(&Task {
                id: "web.a".to_owned(),
                app_id: "/web".to_owned(),
                host: None,
            })
            .await
            .expect("store");

        // A non-task state key must not leak into the listing.
        store
            .create(&state_key(PREFIX, "framework:id"), b"fw".to_vec())
            .await
            .expect("create");

        assert_eq!(tasks.keys().await.expect("keys"), vec!["web.a", "web.b"]);
        assert!(tasks.expunge("web.a").await.expect("expunge"));
        assert!(!tasks.expunge("web.a").await.expect("expunge again"));
    }
}
