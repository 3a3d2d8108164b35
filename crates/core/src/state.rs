#![forbid(unsafe_code)]

//! Persisted scheduler state records.
//!
//! Config versions are opaque strings whose lexicographic order is ascending
//! config-time order (RFC 3339 timestamps in practice).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-application metadata distinguishing new-config changes from
/// scale/restart-only changes across historical configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub last_scaling_at: String,
    pub last_config_change_at: String,
}

impl VersionInfo {
    pub fn for_new_config(version: &str) -> Self {
        Self {
            version: version.to_owned(),
            last_scaling_at: version.to_owned(),
            last_config_change_at: version.to_owned(),
        }
    }

    /// The config changed only in scale or restart terms: the config-change
    /// timestamp is retained.
    pub fn with_scale_or_restart_change(&self, version: &str) -> Self {
        Self {
            version: version.to_owned(),
            last_scaling_at: version.to_owned(),
            last_config_change_at: self.last_config_change_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub id: String,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub instances: u32,
    pub version: String,
    #[serde(default)]
    pub version_info: Option<VersionInfo>,
}

impl AppDefinition {
    /// True when `next` changes anything beyond instance count: a new
    /// configuration rather than a scale or restart.
    pub fn is_upgrade(&self, next: &AppDefinition) -> bool {
        self.cmd != next.cmd || self.args != next.args || self.env != next.env
    }

    #[must_use]
    pub fn with_version_info(mut self, info: VersionInfo) -> Self {
        self.version_info = Some(info);
        self
    }
}

/// Hierarchical container of application definitions. The root group is the
/// authoritative picture of which apps are live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub apps: BTreeMap<String, AppDefinition>,
    #[serde(default)]
    pub groups: Vec<Group>,
    pub version: String,
}

impl Group {
    pub fn empty_root() -> Self {
        Self {
            id: "/".to_owned(),
            apps: BTreeMap::new(),
            groups: Vec::new(),
            version: String::new(),
        }
    }

    /// App id -> configured version for every app in this group and all
    /// nested groups.
    pub fn transitive_app_versions(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.collect_app_versions(&mut out);
        out
    }

    fn collect_app_versions(&self, out: &mut BTreeMap<String, String>) {
        for (id, app) in &self.apps {
            out.insert(id.clone(), app.version.clone());
        }
        for group in &self.groups {
            group.collect_app_versions(out);
        }
    }

    /// Replace contained app definitions with their latest produced records.
    #[must_use]
    pub fn with_updated_apps(mut self, latest: &BTreeMap<String, AppDefinition>) -> Self {
        for (id, app) in &mut self.apps {
            if let Some(updated) = latest.get(id) {
                *app = updated.clone();
            }
        }
        self.groups = self
            .groups
            .into_iter()
            .map(|group| group.with_updated_apps(latest))
            .collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub host: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str, cmd: &str, instances: u32, version: &str) -> AppDefinition {
        AppDefinition {
            id: id.to_owned(),
            cmd: Some(cmd.to_owned()),
            args: Vec::new(),
            env: BTreeMap::new(),
            instances,
            version: version.to_owned(),
            version_info: None,
        }
    }

    #[test]
    fn for_new_config_stamps_all_fields() {
        let info = VersionInfo::for_new_config("2015-01-01T00:00:00Z");
        assert_eq!(info.version, "2015-01-01T00:00:00Z");
        assert_eq!(info.last_scaling_at, "2015-01-01T00:00:00Z");
        assert_eq!(info.last_config_change_at, "2015-01-01T00:00:00Z");
    }

    #[test]
    fn scale_change_retains_config_change_timestamp() {
        let info = VersionInfo::for_new_config("2015-01-01T00:00:00Z")
            .with_scale_or_restart_change("2015-02-01T00:00:00Z");
        assert_eq!(info.version, "2015-02-01T00:00:00Z");
        assert_eq!(info.last_scaling_at, "2015-02-01T00:00:00Z");
        assert_eq!(info.last_config_change_at, "2015-01-01T00:00:00Z");
    }

    #[test]
    fn instance_only_change_is_not_an_upgrade() {
        let before = app("/a", "sleep 1", 1, "v1");
        let mut after = app("/a", "sleep 1", 5, "v2");
        assert!(!before.is_upgrade(&after));

        after.cmd = Some("sleep 2".to_owned());
        assert!(before.is_upgrade(&after));
    }

    #[test]
    fn env_change_is_an_upgrade() {
        let before = app("/a", "sleep 1", 1, "v1");
        let mut after = before.clone();
        after.env.insert("MODE".to_owned(), "fast".to_owned());
        assert!(before.is_upgrade(&after));
    }

    #[test]
    fn transitive_app_versions_walks_nested_groups() {
        let mut root = Group::empty_root();
        root.apps.insert("/a".to_owned(), app("/a", "run", 1, "v1"));
        let mut sub = Group {
            id: "/sub".to_owned(),
            apps: BTreeMap::new(),
            groups: Vec::new(),
            version: "v2".to_owned(),
        };
        sub.apps.insert("/sub/b".to_owned(), app("/sub/b", "run", 1, "v2"));
        root.groups.push(sub);

        let versions = root.transitive_app_versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions["/a"], "v1");
        assert_eq!(versions["/sub/b"], "v2");
    }

    #[test]
    fn with_updated_apps_rewrites_nested_definitions() {
        let mut root = Group::empty_root();
        root.apps.insert("/a".to_owned(), app("/a", "run", 1, "v1"));
        let mut sub = Group {
            id: "/sub".to_owned(),
            apps: BTreeMap::new(),
            groups: Vec::new(),
            version: "v1".to_owned(),
        };
        sub.apps.insert("/sub/b".to_owned(), app("/sub/b", "run", 1, "v1"));
        root.groups.push(sub);

        let mut latest = BTreeMap::new();
        latest.insert(
            "/sub/b".to_owned(),
            app("/sub/b", "run", 1, "v1")
                .with_version_info(VersionInfo::for_new_config("v1")),
        );

        let updated = root.with_updated_apps(&latest);
        assert!(updated.apps["/a"].version_info.is_none());
        assert!(updated.groups[0].apps["/sub/b"].version_info.is_some());
    }
}
