use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use strum_macros::{Display, EnumString};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::backend::{
    BackendError, BackendKind, CancelFlag, DisplayBackend, DisplayConnection, DisplayTarget,
};
use crate::errors::{ConfigError, Error, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Timeout,
    Cancelling,
}

impl SessionState {
    /// A connect attempt is outstanding in the backend.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Timeout | SessionState::Cancelling
        )
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub client_id: String,
    pub backend_kind: BackendKind,
    pub state: SessionState,
    pub timeout_seconds: u64,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<DisplayTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct SessionInner {
    state: SessionState,
    timeout: Duration,
    cancel: CancelFlag,
    cancel_requested: bool,
    /// Bumped whenever an attempt is abandoned. Completions carrying an older
    /// generation are discarded.
    generation: u64,
    connect_started: Option<Instant>,
    target: Option<DisplayTarget>,
    connection: Option<Box<dyn DisplayConnection>>,
    last_error: Option<String>,
}

struct Shared {
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }
}

/// One remote display connection and its timeout-and-cancel protocol.
///
/// `connect` never waits for the backend: the attempt runs on the blocking
/// pool and its result is applied when it arrives, unless the session moved
/// on in the meantime. Callers poll [`check_timeout`](Self::check_timeout)
/// and decide for themselves when to cancel or force a cleanup.
pub struct RemoteDisplaySession {
    client_id: String,
    backend: Arc<dyn DisplayBackend>,
    cancel_grace: Duration,
    shared: Arc<Shared>,
}

impl RemoteDisplaySession {
    pub fn new(
        client_id: impl Into<String>,
        backend: Arc<dyn DisplayBackend>,
        default_timeout: Duration,
        cancel_grace: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            client_id: client_id.into(),
            backend,
            cancel_grace,
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner {
                    state: SessionState::Disconnected,
                    timeout: default_timeout,
                    cancel: CancelFlag::new(),
                    cancel_requested: false,
                    generation: 0,
                    connect_started: None,
                    target: None,
                    connection: None,
                    last_error: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn status_string(&self) -> String {
        self.state().to_string()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn set_timeout(&self, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(ConfigError::InvalidField {
                field: "timeoutSeconds",
                reason: "must be greater than zero".into(),
            }
            .into());
        }
        self.shared.lock().timeout = Duration::from_secs(seconds);
        Ok(())
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.shared.lock().timeout.as_secs()
    }

    /// Begin a connect attempt. Only allowed from `disconnected`.
    pub fn connect(&self, target: DisplayTarget) -> Result<()> {
        let (generation, cancel) = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Disconnected {
                return Err(Error::Conflict(format!(
                    "display session {} is {}",
                    self.client_id, inner.state
                )));
            }
            inner.generation += 1;
            inner.cancel = CancelFlag::new();
            inner.cancel_requested = false;
            inner.connect_started = Some(Instant::now());
            inner.target = Some(target.clone());
            inner.last_error = None;
            self.shared.transition(&mut inner, SessionState::Connecting);
            (inner.generation, inner.cancel.clone())
        };

        info!(
            "Display session {}: connecting to {}:{} over {}",
            self.client_id,
            target.host,
            target.port,
            self.backend.kind()
        );

        let backend = self.backend.clone();
        let attempt = tokio::task::spawn_blocking(move || backend.connect(&target, &cancel));

        let shared = self.shared.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            let outcome = match attempt.await {
                Ok(outcome) => outcome,
                Err(e) => Err(BackendError::Connect(format!("connect task failed: {}", e))),
            };
            complete(&shared, &client_id, generation, outcome);
        });

        Ok(())
    }

    /// Close an established connection. A session that is already
    /// disconnected succeeds trivially; a pending attempt must be cancelled
    /// instead.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = {
            let mut inner = self.shared.lock();
            match inner.state {
                SessionState::Disconnected => return Ok(()),
                SessionState::Connected => {
                    let connection = inner.connection.take();
                    inner.connect_started = None;
                    self.shared.transition(&mut inner, SessionState::Disconnected);
                    connection
                }
                SessionState::Cancelling => {
                    return Err(Error::Cancelled(format!(
                        "connect attempt on display session {}",
                        self.client_id
                    )));
                }
                state => {
                    return Err(Error::Conflict(format!(
                        "display session {} is {}, cancel the attempt instead",
                        self.client_id, state
                    )));
                }
            }
        };

        info!("Display session {}: disconnecting", self.client_id);
        let Some(connection) = connection else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || connection.disconnect())
            .await
            .map_err(|e| Error::NativeCall(format!("disconnect task failed: {}", e)))?
            .map_err(|e| Error::NativeCall(e.to_string()))
    }

    /// Elapsed seconds of the pending attempt once it is past the timeout.
    /// Moves `connecting` to `timeout` the first time; the attempt itself
    /// keeps running.
    pub fn check_timeout(&self) -> Option<u64> {
        let mut inner = self.shared.lock();
        if !matches!(inner.state, SessionState::Connecting | SessionState::Timeout) {
            return None;
        }
        let elapsed = inner.connect_started?.elapsed();
        if elapsed < inner.timeout {
            return None;
        }
        if inner.state == SessionState::Connecting {
            warn!(
                "Display session {}: connect exceeded {}s",
                self.client_id,
                inner.timeout.as_secs()
            );
            self.shared.transition(&mut inner, SessionState::Timeout);
        }
        Some(elapsed.as_secs())
    }

    /// Ask the backend to abandon the pending attempt. Returns `false` if
    /// there is nothing to cancel. If the backend has not settled once the
    /// grace window passes, the session is force-cleaned.
    pub fn request_cancel(&self) -> bool {
        let generation = {
            let mut inner = self.shared.lock();
            if !matches!(inner.state, SessionState::Connecting | SessionState::Timeout) {
                return inner.state == SessionState::Cancelling;
            }
            inner.cancel.cancel();
            inner.cancel_requested = true;
            self.shared.transition(&mut inner, SessionState::Cancelling);
            inner.generation
        };

        info!("Display session {}: cancel requested", self.client_id);

        let shared = self.shared.clone();
        let client_id = self.client_id.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut inner = shared.lock();
            if inner.generation == generation && inner.state == SessionState::Cancelling {
                warn!(
                    "Display session {}: backend ignored cancel for {:?}, forcing cleanup",
                    client_id, grace
                );
                force(&shared, &mut inner);
            }
        });

        true
    }

    /// Unconditionally return to `disconnected`. Never calls into the
    /// backend; whatever the pending attempt produces later is dropped.
    pub fn force_cleanup(&self) -> SessionState {
        let mut inner = self.shared.lock();
        let previous = inner.state;
        force(&self.shared, &mut inner);
        info!(
            "Display session {}: forced cleanup from {}",
            self.client_id, previous
        );
        previous
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.shared.lock();
        SessionStatus {
            client_id: self.client_id.clone(),
            backend_kind: self.backend.kind(),
            state: inner.state,
            timeout_seconds: inner.timeout.as_secs(),
            cancel_requested: inner.cancel_requested,
            elapsed_seconds: inner
                .connect_started
                .filter(|_| inner.state != SessionState::Disconnected)
                .map(|started| started.elapsed().as_secs()),
            target: inner.target.clone(),
            last_error: inner.last_error.clone(),
        }
    }
}

fn force(shared: &Shared, inner: &mut SessionInner) {
    inner.generation += 1;
    inner.cancel.cancel();
    inner.cancel_requested = false;
    inner.connect_started = None;
    // Dropping releases the connection without a backend round trip.
    inner.connection = None;
    shared.transition(inner, SessionState::Disconnected);
}

fn complete(
    shared: &Shared,
    client_id: &str,
    generation: u64,
    outcome: Result<Box<dyn DisplayConnection>, BackendError>,
) {
    let mut inner = shared.lock();
    if inner.generation != generation {
        debug!(
            "Display session {}: discarding stale connect result (generation {} < {})",
            client_id, generation, inner.generation
        );
        return;
    }

    match (inner.state, outcome) {
        (SessionState::Connecting | SessionState::Timeout, Ok(connection)) => {
            info!("Display session {}: connected", client_id);
            inner.connection = Some(connection);
            shared.transition(&mut inner, SessionState::Connected);
        }
        (SessionState::Cancelling, Ok(_)) => {
            info!(
                "Display session {}: connect finished after cancel, dropping it",
                client_id
            );
            inner.connect_started = None;
            shared.transition(&mut inner, SessionState::Disconnected);
        }
        (_, Err(BackendError::Cancelled)) => {
            info!("Display session {}: connect cancelled", client_id);
            inner.connect_started = None;
            shared.transition(&mut inner, SessionState::Disconnected);
        }
        (_, Err(e)) => {
            warn!("Display session {}: connect failed: {}", client_id, e);
            inner.last_error = Some(e.to_string());
            inner.connect_started = None;
            shared.transition(&mut inner, SessionState::Disconnected);
        }
        (state, Ok(_)) => {
            debug!(
                "Display session {}: ignoring connect result in state {}",
                client_id, state
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ConnectBehavior, MockDisplayBackend};

    fn session(backend: &Arc<MockDisplayBackend>, grace: Duration) -> RemoteDisplaySession {
        RemoteDisplaySession::new("client-1", backend.clone(), DEFAULT_CONNECT_TIMEOUT, grace)
    }

    async fn wait_for(session: &RemoteDisplaySession, state: SessionState) {
        let mut changes = session.state_changes();
        tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    fn target() -> DisplayTarget {
        DisplayTarget::new("10.0.0.2", 3389)
    }

    #[tokio::test]
    async fn connect_then_disconnect() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Succeed,
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);

        session.connect(target()).unwrap();
        wait_for(&session, SessionState::Connected).await;
        assert_eq!(session.status_string(), "connected");

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn failed_connect_records_the_error() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Vnc,
            ConnectBehavior::Fail("connection refused".into()),
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);

        session.connect(target()).unwrap();
        wait_for(&session, SessionState::Disconnected).await;
        tokio::task::yield_now().await;
        assert_eq!(
            session.status().last_error.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn second_connect_is_rejected_while_pending() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Hang {
                honor_cancel: true,
            },
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);

        session.connect(target()).unwrap();
        assert!(matches!(session.connect(target()), Err(Error::Conflict(_))));
        assert!(matches!(session.disconnect().await, Err(Error::Conflict(_))));

        backend.release();
        wait_for(&session, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn check_timeout_reports_elapsed_time_without_aborting() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Hang {
                honor_cancel: true,
            },
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);
        session.shared.lock().timeout = Duration::from_millis(20);

        session.connect(target()).unwrap();
        assert_eq!(session.check_timeout(), None);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.check_timeout().is_some());
        assert_eq!(session.state(), SessionState::Timeout);
        assert!(session.check_timeout().is_some());

        // The attempt is still allowed to finish.
        backend.release();
        wait_for(&session, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn honored_cancel_settles_to_disconnected() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Vnc,
            ConnectBehavior::Hang {
                honor_cancel: true,
            },
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);

        session.connect(target()).unwrap();
        assert!(session.request_cancel());
        assert_eq!(session.state(), SessionState::Cancelling);
        assert!(session.status().cancel_requested);

        wait_for(&session, SessionState::Disconnected).await;
        assert_eq!(backend.released(), 0);
    }

    #[tokio::test]
    async fn ignored_cancel_is_forced_after_the_grace_window() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Hang {
                honor_cancel: false,
            },
        ));
        let session = session(&backend, Duration::from_millis(50));

        session.connect(target()).unwrap();
        assert!(session.request_cancel());
        assert_eq!(session.status_string(), "cancelling");

        wait_for(&session, SessionState::Disconnected).await;

        // The backend finally returns a connection; it must be discarded.
        backend.release();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(backend.released(), 1);
        assert_eq!(backend.disconnects(), 0);
    }

    #[tokio::test]
    async fn force_cleanup_never_touches_the_backend() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Succeed,
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);

        session.connect(target()).unwrap();
        wait_for(&session, SessionState::Connected).await;

        assert_eq!(session.force_cleanup(), SessionState::Connected);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(backend.disconnects(), 0);
        assert_eq!(backend.released(), 1);

        // A fresh attempt works after cleanup.
        session.connect(target()).unwrap();
        wait_for(&session, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn request_cancel_without_pending_attempt_is_refused() {
        let backend = Arc::new(MockDisplayBackend::new(
            BackendKind::Rdp,
            ConnectBehavior::Succeed,
        ));
        let session = session(&backend, DEFAULT_CANCEL_GRACE);
        assert!(!session.request_cancel());
        assert!(session.set_timeout(0).is_err());
        session.set_timeout(12).unwrap();
        assert_eq!(session.timeout_seconds(), 12);
    }
}
