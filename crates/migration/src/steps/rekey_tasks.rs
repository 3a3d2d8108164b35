#![forbid(unsafe_code)]

//! 0.13 "RekeyTasks and RenameFrameworkId".
//!
//! Legacy task entries were keyed `<appId>:<taskId>`; the task id alone is
//! the key afterwards. Each legacy record is a framed blob (4-byte big-endian
//! size, then the serialized task); a record that is missing, undecodable, or
//! decodes to an empty task id fails the whole step.

use flotilla_core::codec;
use flotilla_core::state::Task;
use flotilla_storage::state_key;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::{StepContext, StepError};

const FRAMEWORK_ID_KEY: &str = "framework:id";
const LEGACY_FRAMEWORK_ID_KEY: &str = "frameworkId";

pub fn rekey_tasks_and_rename_framework_id(
    context: &StepContext,
) -> BoxFuture<'_, Result<(), StepError>> {
    run(context).boxed()
}

async fn run(context: &StepContext) -> Result<(), StepError> {
    rekey_tasks(context).await?;
    rename_framework_id(context).await
}

/// Strictly sequential: no concurrent rewrites of the task namespace.
async fn rekey_tasks(context: &StepContext) -> Result<(), StepError> {
    for key in context.tasks.keys().await? {
        if !is_legacy_task_key(&key) {
            continue;
        }
        let task = decode_legacy_task(context, &key).await?;
        context.tasks.store(&task).await?;
        context.tasks.expunge(&key).await?;
    }
    Ok(())
}

async fn decode_legacy_task(context: &StepContext, key: &str) -> Result<Task, StepError> {
    let Some(bytes) = context.tasks.load_bytes(key).await? else {
        return Err(StepError::CorruptLegacyTask(key.to_owned()));
    };
    let task: Task = codec::decode_record(&bytes)
        .map_err(|_| StepError::CorruptLegacyTask(key.to_owned()))?;
    if task.id.is_empty() {
        return Err(StepError::CorruptLegacyTask(key.to_owned()));
    }
    Ok(task)
}

/// Equivalent to the legacy selector `^.*:.*\..*$`: a colon with a dot
/// somewhere after it. Post-migration keys are bare task ids and never
/// contain a colon.
fn is_legacy_task_key(key: &str) -> bool {
    match key.find(':') {
        Some(colon) => key[colon + 1..].contains('.'),
        None => false,
    }
}

async fn rename_framework_id(context: &StepContext) -> Result<(), StepError> {
    let new_key = state_key(&context.state_prefix, FRAMEWORK_ID_KEY);
    if context.store.load(&new_key).await?.is_some() {
        return Ok(());
    }
    let legacy_key = state_key(&context.state_prefix, LEGACY_FRAMEWORK_ID_KEY);
    if let Some(entity) = context.store.load(&legacy_key).await? {
        tracing::info!("renaming legacy framework id key");
        context.store.create(&new_key, entity.bytes).await?;
        context.store.delete(&legacy_key).await?;
    }
    Ok(())
}
