#![forbid(unsafe_code)]

//! 0.11 "AddVersionInfo": backfill per-application version history.
//!
//! Pre-0.11 app records carry no `version_info`. For every app still present
//! in the root group, walk its stored configs in ascending order and derive
//! the metadata from whether each config upgrades the previous one; apps no
//! longer in the group are expunged. Finally the root group is rewritten with
//! the latest produced definitions.

use std::collections::{BTreeMap, BTreeSet};

use flotilla_core::state::{AppDefinition, Group, VersionInfo};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::{StepContext, StepError};

pub fn add_version_info(context: &StepContext) -> BoxFuture<'_, Result<(), StepError>> {
    run(context).boxed()
}

async fn run(context: &StepContext) -> Result<(), StepError> {
    let root = context
        .groups
        .root()
        .await?
        .unwrap_or_else(Group::empty_root);
    let group_versions = root.transitive_app_versions();

    let mut app_ids: BTreeSet<String> = context.apps.ids().await?.into_iter().collect();
    app_ids.extend(group_versions.keys().cloned());

    let mut latest: BTreeMap<String, AppDefinition> = BTreeMap::new();
    for id in &app_ids {
        match group_versions.get(id) {
            Some(live_version) => {
                if let Some(app) = backfill_app(context, id, live_version).await? {
                    latest.insert(id.clone(), app);
                }
            }
            None => {
                tracing::info!(app = %id, "expunging app absent from the root group");
                context.apps.expunge(id).await?;
            }
        }
    }

    context
        .groups
        .store_root(&root.with_updated_apps(&latest))
        .await?;
    Ok(())
}

/// Fold the app's configs ascending. The group's live version joins the
/// stored set; a version whose record no longer loads is skipped.
async fn backfill_app(
    context: &StepContext,
    id: &str,
    live_version: &str,
) -> Result<Option<AppDefinition>, StepError> {
    let mut versions: BTreeSet<String> = context.apps.versions(id).await?.into_iter().collect();
    versions.insert(live_version.to_owned());

    let mut last: Option<AppDefinition> = None;
    for version in &versions {
        let Some(app) = context.apps.load(id, version).await? else {
            continue;
        };
        let info = match &last {
            Some(previous) => match (&previous.version_info, previous.is_upgrade(&app)) {
                (Some(previous_info), false) => {
                    previous_info.with_scale_or_restart_change(&app.version)
                }
                _ => VersionInfo::for_new_config(&app.version),
            },
            None => VersionInfo::for_new_config(&app.version),
        };
        let app = app.with_version_info(info);
        context.apps.store(&app).await?;
        last = Some(app);
    }
    Ok(last)
}
