use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, info_span, Instrument};

use crate::{
    App,
    errors::Error,
    model::command::{Command, CommandEnvelope, CommandResult},
};

mod device;
mod display;
mod snapshot;
mod vm;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

/// The command dispatcher. Always answers: parse errors, handler errors and
/// handler panics all come back as failure results, tagged with the request
/// `id` when one was given.
pub async fn handle(env: &App, envelope: CommandEnvelope) -> CommandResult {
    let id = envelope.id.clone();
    let kind = envelope.command.clone();
    debug!("Received command {:?}", envelope);

    let span = info_span!("command", command = %kind);
    let outcome = async {
        let command = Command::try_from(envelope)?;
        match AssertUnwindSafe(route(env, command)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::NativeCall(format!(
                "handler for `{}` panicked: {}",
                kind,
                panic_message(panic.as_ref())
            ))),
        }
    }
    .instrument(span)
    .await;

    let mut response = outcome.unwrap_or_else(|e| {
        error!("Command `{}` failed: {}", kind, e);
        CommandResult::failure(e.to_string())
    });
    response.id = id;
    response
}

async fn route(env: &App, command: Command) -> Result<CommandResult> {
    match command {
        Command::StartVm(raw) => vm::handler::start(env, raw).await,
        Command::StopVm(target) => vm::handler::stop(env, target).await,
        Command::PauseVm(target) => vm::handler::pause(env, target).await,
        Command::ResumeVm(target) => vm::handler::resume(env, target).await,
        Command::GetStatus(target) => vm::handler::status(env, target).await,
        Command::GetLogs { target, start_line } => {
            vm::handler::logs(env, target, start_line).await
        }
        Command::CreateSnapshot(snapshot) => snapshot::handler::create(env, snapshot).await,
        Command::RestoreSnapshot(snapshot) => snapshot::handler::restore(env, snapshot).await,
        Command::DeleteSnapshot(snapshot) => snapshot::handler::delete(env, snapshot).await,
        Command::ListSnapshots { vm_name } => snapshot::handler::list(env, vm_name).await,
        Command::GetKvmInfo => device::handler::kvm_info(env).await,
        Command::ScanDevices => device::handler::scan(env).await,
        Command::RefreshDevices => device::handler::refresh(env).await,
        Command::ClearDeviceCache => device::handler::clear_cache(env).await,
        Command::CreateDisplaySession { kind } => display::handler::create(env, kind).await,
        Command::ConnectDisplay { client_id, target } => {
            display::handler::connect(env, client_id, target).await
        }
        Command::DisconnectDisplay { client_id } => {
            display::handler::disconnect(env, client_id).await
        }
        Command::DisplayStatus { client_id } => display::handler::status(env, client_id).await,
        Command::DisplaySetTimeout { client_id, seconds } => {
            display::handler::set_timeout(env, client_id, seconds).await
        }
        Command::DisplayCheckTimeout { client_id } => {
            display::handler::check_timeout(env, client_id).await
        }
        Command::DisplayRequestCancel { client_id } => {
            display::handler::request_cancel(env, client_id).await
        }
        Command::DisplayForceCleanup { client_id } => {
            display::handler::force_cleanup(env, client_id).await
        }
        Command::DestroyDisplaySession { client_id } => {
            display::handler::destroy(env, client_id).await
        }
        Command::ListDisplaySessions => display::handler::list(env).await,
        Command::Unbacked(kind) => vm::handler::unbacked(kind),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
