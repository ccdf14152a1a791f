use serde_json::json;
use tracing::{info, instrument};

use crate::{
    App,
    errors::{ConfigError, Error},
    model::{
        command::{CommandKind, CommandResult, VmTarget},
        vm_config::{self, RawVmConfig},
        vm_status::VmStatus,
    },
    vm_monitor::poll_status,
};

use super::super::Result;

#[instrument(skip(env))]
pub async fn start(env: &App, raw: RawVmConfig) -> Result<CommandResult> {
    let config = vm_config::normalize(raw)?;

    if !env.engine().is_available().await {
        return Err(Error::NativeCall(format!(
            "{} engine is not available",
            env.engine().name()
        )));
    }

    let started = env.engine().start_vm(&config).await?;
    if !started {
        return Err(Error::NativeCall(format!(
            "engine refused to start VM {}",
            config.name
        )));
    }

    let id = config.name.clone();
    env.registry().register(id.clone(), config.name.clone());
    env.monitor().start(&id, &config.name).await;
    info!("VM {} started", id);

    Ok(CommandResult::ok(format!("VM {} started", id))
        .with_vm_id(id)
        .with_status(VmStatus::Starting))
}

#[instrument(skip(env))]
pub async fn stop(env: &App, target: VmTarget) -> Result<CommandResult> {
    let key = target_key(&target)?;
    let (id, name) = target
        .vm_id
        .as_deref()
        .and_then(|id| env.registry().find(id))
        .or_else(|| {
            target
                .vm_name
                .as_deref()
                .and_then(|name| env.registry().find(name))
        })
        .ok_or_else(|| Error::NotFound(format!("VM {}", key)))?;

    let stopped = env.engine().stop_vm(&name).await?;
    if !stopped {
        return Err(Error::NativeCall(format!(
            "engine refused to stop VM {}",
            name
        )));
    }

    env.registry().unregister(&id);
    env.monitor().stop(&id).await;
    info!("VM {} stopped", id);

    Ok(CommandResult::ok(format!("VM {} stopped", id))
        .with_vm_id(id)
        .with_status(VmStatus::Stopped))
}

#[instrument(skip(env))]
pub async fn pause(env: &App, target: VmTarget) -> Result<CommandResult> {
    let name = resolve(env, &target)?;
    if !env.features().pause_resume {
        return Err(Error::Unsupported("pause_vm".into()));
    }
    if !env.engine().pause_vm(&name).await? {
        return Err(Error::NativeCall(format!("failed to pause VM {}", name)));
    }
    Ok(CommandResult::ok(format!("VM {} paused", name))
        .with_vm_id(vm_id(&target, &name))
        .with_status(VmStatus::Paused))
}

#[instrument(skip(env))]
pub async fn resume(env: &App, target: VmTarget) -> Result<CommandResult> {
    let name = resolve(env, &target)?;
    if !env.features().pause_resume {
        return Err(Error::Unsupported("resume_vm".into()));
    }
    if !env.engine().resume_vm(&name).await? {
        return Err(Error::NativeCall(format!("failed to resume VM {}", name)));
    }
    Ok(CommandResult::ok(format!("VM {} resumed", name))
        .with_vm_id(vm_id(&target, &name))
        .with_status(VmStatus::Running))
}

#[instrument(skip(env))]
pub async fn status(env: &App, target: VmTarget) -> Result<CommandResult> {
    let name = resolve(env, &target)?;
    let status = poll_status(env.engine(), &name).await;
    Ok(CommandResult::ok(format!("VM {} is {}", name, status))
        .with_vm_id(vm_id(&target, &name))
        .with_status(status))
}

#[instrument(skip(env))]
pub async fn logs(
    env: &App,
    target: VmTarget,
    start_line: Option<usize>,
) -> Result<CommandResult> {
    let name = resolve(env, &target)?;
    if !env.features().logs {
        return Err(Error::Unsupported("get_vm_logs".into()));
    }
    let lines = env.engine().get_vm_logs(&name, start_line).await?;
    let start = start_line.unwrap_or(0);
    Ok(
        CommandResult::ok(format!("{} log lines for VM {}", lines.len(), name))
            .with_vm_id(vm_id(&target, &name))
            .with_data(json!({
                "startLine": start,
                "nextLine": start + lines.len(),
                "lines": lines,
            })),
    )
}

pub fn unbacked(kind: CommandKind) -> Result<CommandResult> {
    Err(Error::Unsupported(kind.to_string()))
}

fn target_key(target: &VmTarget) -> Result<String> {
    target
        .vm_id
        .clone()
        .or_else(|| target.vm_name.clone())
        .filter(|key| !key.is_empty())
        .ok_or(Error::Config(ConfigError::MissingField("vmId")))
}

fn resolve(env: &App, target: &VmTarget) -> Result<String> {
    env.registry()
        .resolve(target.vm_id.as_deref(), target.vm_name.as_deref())
        .ok_or(Error::Config(ConfigError::MissingField("vmId")))
}

fn vm_id(target: &VmTarget, name: &str) -> String {
    target
        .vm_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| name.to_string())
}
