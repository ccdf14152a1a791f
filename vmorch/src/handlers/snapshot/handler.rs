use serde_json::json;
use tracing::instrument;

use crate::{
    App,
    model::command::{CommandResult, SnapshotRef},
};

use super::super::Result;

#[instrument(skip(env))]
pub async fn create(env: &App, snapshot: SnapshotRef) -> Result<CommandResult> {
    env.snapshots().create(&snapshot).await?;
    Ok(CommandResult::ok(format!(
        "snapshot {} created for VM {}",
        snapshot.snapshot_name, snapshot.vm_name
    ))
    .with_vm_id(snapshot.vm_name))
}

#[instrument(skip(env))]
pub async fn restore(env: &App, snapshot: SnapshotRef) -> Result<CommandResult> {
    env.snapshots().restore(&snapshot).await?;
    Ok(CommandResult::ok(format!(
        "VM {} restored to snapshot {}",
        snapshot.vm_name, snapshot.snapshot_name
    ))
    .with_vm_id(snapshot.vm_name))
}

#[instrument(skip(env))]
pub async fn delete(env: &App, snapshot: SnapshotRef) -> Result<CommandResult> {
    env.snapshots().delete(&snapshot).await?;
    Ok(CommandResult::ok(format!(
        "snapshot {} deleted for VM {}",
        snapshot.snapshot_name, snapshot.vm_name
    ))
    .with_vm_id(snapshot.vm_name))
}

#[instrument(skip(env))]
pub async fn list(env: &App, vm_name: String) -> Result<CommandResult> {
    let snapshots = env.snapshots().list(&vm_name).await?;
    Ok(
        CommandResult::ok(format!("{} snapshots for VM {}", snapshots.len(), vm_name))
            .with_vm_id(vm_name)
            .with_data(json!({ "snapshots": snapshots })),
    )
}
