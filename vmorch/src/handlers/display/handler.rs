use serde_json::json;
use tracing::instrument;

use crate::{
    App,
    display::{BackendKind, DisplayTarget, SessionState},
    errors::Error,
    model::command::CommandResult,
};

use super::super::Result;

#[instrument(skip(env))]
pub async fn create(env: &App, kind: BackendKind) -> Result<CommandResult> {
    let session = env.displays().create(kind)?;
    Ok(
        CommandResult::ok(format!("{} display session created", kind))
            .with_status(session.status_string())
            .with_data(json!({
                "clientId": session.client_id(),
                "session": session.status(),
            })),
    )
}

#[instrument(skip(env))]
pub async fn connect(env: &App, client_id: String, target: DisplayTarget) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    session.connect(target)?;
    Ok(
        CommandResult::ok(format!("display session {} connecting", client_id))
            .with_status(session.status_string()),
    )
}

#[instrument(skip(env))]
pub async fn disconnect(env: &App, client_id: String) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    session.disconnect().await?;
    Ok(
        CommandResult::ok(format!("display session {} disconnected", client_id))
            .with_status(session.status_string()),
    )
}

#[instrument(skip(env))]
pub async fn status(env: &App, client_id: String) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    let status = session.status();
    Ok(
        CommandResult::ok(format!("display session {} is {}", client_id, status.state))
            .with_status(status.state)
            .with_data(json!(status)),
    )
}

#[instrument(skip(env))]
pub async fn set_timeout(env: &App, client_id: String, seconds: u64) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    session.set_timeout(seconds)?;
    Ok(CommandResult::ok(format!(
        "display session {} timeout set to {}s",
        client_id, seconds
    ))
    .with_data(json!({ "timeoutSeconds": seconds })))
}

/// Over the threshold the result is a `TimeoutExceeded` failure carrying the
/// elapsed time. The attempt keeps running either way.
#[instrument(skip(env))]
pub async fn check_timeout(env: &App, client_id: String) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    let response = match session.check_timeout() {
        Some(elapsed) => CommandResult::failure(Error::TimeoutExceeded(elapsed).to_string())
            .with_data(json!({ "timedOut": true, "elapsedSeconds": elapsed })),
        None => CommandResult::ok(format!("display session {} within timeout", client_id))
            .with_data(json!({ "timedOut": false })),
    };
    Ok(response.with_status(session.status_string()))
}

#[instrument(skip(env))]
pub async fn request_cancel(env: &App, client_id: String) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    if !session.request_cancel() {
        return Err(Error::Conflict(format!(
            "display session {} has no pending connect to cancel",
            client_id
        )));
    }
    Ok(
        CommandResult::ok(format!("cancel requested for display session {}", client_id))
            .with_status(SessionState::Cancelling),
    )
}

#[instrument(skip(env))]
pub async fn force_cleanup(env: &App, client_id: String) -> Result<CommandResult> {
    let session = env.displays().get(&client_id)?;
    let previous = session.force_cleanup();
    Ok(CommandResult::ok(format!(
        "display session {} forced from {} to disconnected",
        client_id, previous
    ))
    .with_status(session.status_string()))
}

#[instrument(skip(env))]
pub async fn destroy(env: &App, client_id: String) -> Result<CommandResult> {
    env.displays().destroy(&client_id)?;
    Ok(CommandResult::ok(format!(
        "display session {} destroyed",
        client_id
    )))
}

#[instrument(skip(env))]
pub async fn list(env: &App) -> Result<CommandResult> {
    let sessions = env.displays().list();
    Ok(
        CommandResult::ok(format!("{} display sessions", sessions.len()))
            .with_data(json!({ "sessions": sessions })),
    )
}
