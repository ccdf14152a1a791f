use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    App,
    configuration::Settings,
    display::{BackendKind, DisplaySessions, TcpDisplayBackend},
    handlers::handle,
    engine::NativeEngine,
    model::{
        command::{CommandEnvelope, CommandKind, CommandResult},
        vm_status::VmStatus,
    },
    qemu::QemuEngine,
    registry::VmRegistry,
    vm_monitor::{StatusUpdate, poll_status},
};

struct Request {
    envelope: CommandEnvelope,
    respond_to: oneshot::Sender<CommandResult>,
}

/// Producer side of the command channel.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Request>,
}

impl CommandSender {
    /// Queue a command and wait for its result.
    pub async fn send(&self, envelope: CommandEnvelope) -> CommandResult {
        let id = envelope.id.clone();
        let (respond_to, response) = oneshot::channel();
        if self.tx.send(Request { envelope, respond_to }).await.is_err() {
            return closed(id);
        }
        response.await.unwrap_or_else(|_| closed(id))
    }
}

fn closed(id: Option<serde_json::Value>) -> CommandResult {
    let mut result = CommandResult::failure("command channel is closed");
    result.id = id;
    result
}

/// Assemble the application around the QEMU engine and TCP display
/// backends.
pub fn build_app(settings: &Settings) -> App {
    let engine = Arc::new(QemuEngine::new(settings.qemu.clone()));
    let connect_timeout = settings.display.default_timeout();
    let displays = DisplaySessions::new(connect_timeout, settings.display.cancel_grace())
        .with_backend(Arc::new(TcpDisplayBackend::new(
            BackendKind::Rdp,
            connect_timeout,
        )))
        .with_backend(Arc::new(TcpDisplayBackend::new(
            BackendKind::Vnc,
            connect_timeout,
        )));
    App::new(engine, displays, settings.monitor.poll_interval())
}

fn runs_detached(envelope: &CommandEnvelope) -> bool {
    envelope
        .command
        .trim()
        .parse::<CommandKind>()
        .is_ok_and(|kind| kind.runs_detached())
}

/// Spawn the single consumer loop. The loop ends once every
/// [`CommandSender`] is dropped, and stops all status monitors on its way out.
///
/// Commands that wait on a full device scan are answered from their own
/// task so the loop keeps serving display and VM commands meanwhile.
pub fn run(app: App, capacity: usize) -> (CommandSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Request>(capacity.max(1));

    tokio::spawn(reap_failed_vms(
        app.engine_arc(),
        app.registry_arc(),
        app.monitor().subscribe(),
    ));

    let consumer = tokio::spawn(async move {
        info!("Command loop started");
        while let Some(Request {
            envelope,
            respond_to,
        }) = rx.recv().await
        {
            if runs_detached(&envelope) {
                let app = app.clone();
                tokio::spawn(async move {
                    let _ = respond_to.send(handle(&app, envelope).await);
                });
                continue;
            }
            let result = handle(&app, envelope).await;
            // The caller may have given up waiting.
            let _ = respond_to.send(result);
        }
        app.monitor().stop_all().await;
        info!("Command loop finished");
    });

    (CommandSender { tx }, consumer)
}

/// A VM the monitor saw fail is no longer known to the orchestrator. The
/// engine is asked again first, since a stale update may predate a restart.
async fn reap_failed_vms(
    engine: Arc<dyn NativeEngine>,
    registry: Arc<VmRegistry>,
    mut updates: broadcast::Receiver<StatusUpdate>,
) {
    loop {
        match updates.recv().await {
            Ok(update) if update.status == VmStatus::Failed => {
                let Some(name) = registry.lookup(&update.vm_id) else {
                    continue;
                };
                if poll_status(engine.as_ref(), &name).await != VmStatus::Failed {
                    debug!("Ignoring stale failure of VM {}", update.vm_id);
                    continue;
                }
                if registry.unregister(&update.vm_id).is_some() {
                    warn!("VM {} failed, removed from registry", update.vm_id);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Registry reaper skipped {} status updates", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[derive(Serialize)]
struct StatusEvent<'a> {
    event: &'static str,
    #[serde(flatten)]
    update: &'a StatusUpdate,
}

/// JSON line for a status notification on the command channel's output.
pub fn status_event_line(update: &StatusUpdate) -> Result<String, serde_json::Error> {
    serde_json::to_string(&StatusEvent {
        event: "status_update",
        update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::session::{DEFAULT_CANCEL_GRACE, DEFAULT_CONNECT_TIMEOUT};
    use crate::mock::{ConnectBehavior, MockDisplayBackend, MockEngine};
    use chrono::Utc;
    use serde_json::json;
    use tokio::time::{Duration, Instant};

    fn mock_app(engine: &Arc<MockEngine>) -> App {
        App::new(
            engine.clone(),
            DisplaySessions::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_CANCEL_GRACE),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn responses_carry_the_request_id() {
        let engine = Arc::new(MockEngine::new());
        let (commands, consumer) = run(mock_app(&engine), 4);

        let envelope: CommandEnvelope =
            serde_json::from_value(json!({"id": 42, "command": "get_status", "vmName": "vm1"}))
                .unwrap();
        let result = commands.send(envelope).await;
        assert!(result.success);
        assert_eq!(result.id, Some(json!(42)));

        drop(commands);
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_vms_are_reaped_from_the_registry() {
        let engine = Arc::new(MockEngine::new());
        let app = mock_app(&engine);
        let registry = app.registry_arc();
        let mut updates = app.monitor().subscribe();
        let (commands, _consumer) = run(app, 4);

        let started = commands
            .send(CommandEnvelope::new("start_vm").vm_config(
                json!({"name": "vm1", "memoryMB": 256, "cpuCount": 1, "diskSizeGB": 1}),
            ))
            .await;
        assert!(started.success);
        engine.set_status("vm1", "failed");

        assert_eq!(updates.recv().await.unwrap().status, VmStatus::Failed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.lookup("vm1").is_none());
    }

    #[tokio::test]
    async fn stale_failure_does_not_remove_a_restarted_vm() {
        let engine = Arc::new(MockEngine::new());
        engine.set_status("vm1", "running");
        let registry = Arc::new(VmRegistry::new());
        registry.register("vm1", "vm1");

        let (tx, rx) = broadcast::channel(4);
        tx.send(StatusUpdate {
            vm_id: "vm1".into(),
            status: VmStatus::Failed,
            timestamp: Utc::now(),
        })
        .unwrap();
        drop(tx);

        reap_failed_vms(engine.clone(), registry.clone(), rx).await;
        assert_eq!(registry.lookup("vm1").as_deref(), Some("vm1"));
        assert_eq!(engine.calls("get_vm_status"), 1);
    }

    #[tokio::test]
    async fn slow_refresh_does_not_hold_up_display_commands() {
        let engine = Arc::new(MockEngine::new().with_scan_delay(Duration::from_secs(3)));
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Succeed,
        ));
        let displays = DisplaySessions::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_CANCEL_GRACE)
            .with_backend(backend.clone());
        let (commands, _consumer) = run(
            App::new(engine.clone(), displays, Duration::from_secs(5)),
            4,
        );

        let created = commands
            .send(CommandEnvelope::new("create_display_session").field("backendKind", "rdp"))
            .await;
        let client_id = created.data.unwrap()["clientId"]
            .as_str()
            .unwrap()
            .to_string();

        let refresh = tokio::spawn({
            let commands = commands.clone();
            async move { commands.send(CommandEnvelope::new("refresh_devices")).await }
        });
        while engine.calls("scan_devices") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        let cleanup = commands
            .send(CommandEnvelope::new("display_force_cleanup").field("clientId", client_id))
            .await;
        assert!(cleanup.success, "{}", cleanup.message);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!refresh.is_finished());
    }

    #[test]
    fn status_events_are_tagged() {
        let update = StatusUpdate {
            vm_id: "vm1".into(),
            status: VmStatus::Running,
            timestamp: Utc::now(),
        };
        let line: serde_json::Value =
            serde_json::from_str(&status_event_line(&update).unwrap()).unwrap();
        assert_eq!(line["event"], json!("status_update"));
        assert_eq!(line["vmId"], json!("vm1"));
        assert_eq!(line["status"], json!("running"));
    }
}
