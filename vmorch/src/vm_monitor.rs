/// Per-VM background pollers that ask the engine for the live status of each
/// started VM and broadcast a `StatusUpdate` on every tick. A poller stops on
/// its own once the VM reaches a terminal status.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::engine::NativeEngine;
use crate::model::vm_status::VmStatus;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub vm_id: String,
    pub status: VmStatus,
    pub timestamp: DateTime<Utc>,
}

struct MonitorHandle {
    epoch: u64,
    name: String,
    task: JoinHandle<()>,
}

struct MonitorInner {
    engine: Arc<dyn NativeEngine>,
    period: Duration,
    handles: Mutex<HashMap<String, MonitorHandle>>,
    next_epoch: AtomicU64,
    updates: broadcast::Sender<StatusUpdate>,
}

#[derive(Clone)]
pub struct StatusMonitor {
    inner: Arc<MonitorInner>,
}

impl StatusMonitor {
    pub fn new(engine: Arc<dyn NativeEngine>, period: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                engine,
                period,
                handles: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
                updates,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.updates.subscribe()
    }

    /// Start polling `name` under `id`. Returns `false` without doing
    /// anything if a poller for `id` is already live.
    pub async fn start(&self, id: &str, name: &str) -> bool {
        let mut handles = self.inner.handles.lock().await;
        if let Some(existing) = handles.get(id) {
            debug!(
                "Status monitor for {} already running (polling {})",
                id, existing.name
            );
            return false;
        }

        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_monitor(
            Arc::downgrade(&self.inner),
            self.inner.engine.clone(),
            self.inner.period,
            id.to_string(),
            name.to_string(),
            epoch,
        ));
        handles.insert(
            id.to_string(),
            MonitorHandle {
                epoch,
                name: name.to_string(),
                task,
            },
        );
        info!("Status monitor started for VM {} ({})", id, name);
        true
    }

    /// Cancel the poller for `id`. Safe to call when none is running.
    pub async fn stop(&self, id: &str) -> bool {
        let handle = self.inner.handles.lock().await.remove(id);
        match handle {
            Some(handle) => {
                handle.task.abort();
                info!("Status monitor stopped for VM {}", id);
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.handles.lock().await.contains_key(id)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.handles.lock().await.len()
    }

    pub async fn stop_all(&self) {
        let handles: Vec<MonitorHandle> = self
            .inner
            .handles
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.task.abort();
        }
    }
}

/// One status query. Engine failures are reported as `error`, never raised.
pub async fn poll_status(engine: &dyn NativeEngine, name: &str) -> VmStatus {
    match engine.get_vm_status(name).await {
        Ok(raw) => VmStatus::normalize(&raw),
        Err(e) => {
            warn!("Status monitor: failed to query VM {}: {}", name, e);
            VmStatus::Error
        }
    }
}

async fn run_monitor(
    inner: Weak<MonitorInner>,
    engine: Arc<dyn NativeEngine>,
    period: Duration,
    id: String,
    name: String,
    epoch: u64,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<VmStatus> = None;

    loop {
        ticker.tick().await;

        let status = poll_status(engine.as_ref(), &name).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        if last != Some(status) {
            info!(
                "Status monitor: VM {} status changed from {:?} to {}",
                id, last, status
            );
            last = Some(status);
        }

        // No subscribers is fine.
        let _ = inner.updates.send(StatusUpdate {
            vm_id: id.clone(),
            status,
            timestamp: Utc::now(),
        });

        if status.is_terminal() {
            let mut handles = inner.handles.lock().await;
            if handles.get(&id).is_some_and(|h| h.epoch == epoch) {
                handles.remove(&id);
            }
            info!(
                "Status monitor for VM {} finished with terminal status {}",
                id, status
            );
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    fn monitor(engine: &Arc<MockEngine>) -> StatusMonitor {
        StatusMonitor::new(engine.clone(), DEFAULT_POLL_INTERVAL)
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_per_id() {
        let engine = Arc::new(MockEngine::new());
        engine.set_status("vm1", "running");
        let monitor = monitor(&engine);

        assert!(monitor.start("vm1", "vm1").await);
        assert!(!monitor.start("vm1", "vm1").await);
        assert_eq!(monitor.active_count().await, 1);

        monitor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn emits_updates_and_removes_itself_on_terminal_status() {
        let engine = Arc::new(MockEngine::new());
        engine.set_status("vm1", "running");
        let monitor = monitor(&engine);
        let mut updates = monitor.subscribe();

        monitor.start("vm1", "vm1").await;
        let first = updates.recv().await.unwrap();
        assert_eq!(first.vm_id, "vm1");
        assert_eq!(first.status, VmStatus::Running);
        assert!(monitor.is_active("vm1").await);

        engine.set_status("vm1", "stopped");
        let last = updates.recv().await.unwrap();
        assert_eq!(last.status, VmStatus::Stopped);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_active("vm1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_engine_status_is_reported_as_stopped() {
        let engine = Arc::new(MockEngine::new());
        engine.set_status("vm1", "exploded");
        let monitor = monitor(&engine);
        let mut updates = monitor.subscribe();

        monitor.start("vm1", "vm1").await;
        assert_eq!(updates.recv().await.unwrap().status, VmStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_failure_is_reported_as_error() {
        let engine = Arc::new(MockEngine::new());
        engine.set_status("vm1", "running");
        engine.fail_status_queries(true);
        let monitor = monitor(&engine);
        let mut updates = monitor.subscribe();

        monitor.start("vm1", "vm1").await;
        assert_eq!(updates.recv().await.unwrap().status, VmStatus::Error);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_safe_without_a_monitor() {
        let engine = Arc::new(MockEngine::new());
        let monitor = monitor(&engine);

        assert!(!monitor.stop("ghost").await);

        engine.set_status("vm1", "running");
        monitor.start("vm1", "vm1").await;
        assert!(monitor.stop("vm1").await);
        assert!(!monitor.stop("vm1").await);
        assert!(!monitor.is_active("vm1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn a_finished_poller_does_not_remove_its_replacement() {
        let engine = Arc::new(MockEngine::new());
        engine.set_status("vm1", "running");
        let monitor = monitor(&engine);

        monitor.start("vm1", "vm1").await;
        monitor.stop("vm1").await;
        monitor.start("vm1", "vm1").await;

        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 3).await;
        assert!(monitor.is_active("vm1").await);
        monitor.stop_all().await;
    }
}
